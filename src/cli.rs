use clap::{Parser, Subcommand, ValueEnum};

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum, Debug)]
#[clap(rename_all = "verbatim")]
pub enum GeometryChoice {
    /// One column of two kamlets, one jamlet each.
    Column,
    /// 2x2 kamlets with 2x1 jamlets each.
    Square,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(short, long, value_enum, default_value_t = GeometryChoice::Column)]
    pub geometry: GeometryChoice,

    /// Cycle budget before the run is declared hung.
    #[arg(long, default_value_t = 100_000)]
    pub max_cycles: u64,

    /// Write the monitor's event trace to this path after the run.
    #[arg(long)]
    pub trace: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Parser, Debug, Clone, Copy)]
pub struct DemoArgs {
    /// Elements per vector operation.
    #[arg(long, default_value_t = 8)]
    pub vl: usize,
    /// Element width in bits.
    #[arg(long, default_value_t = 32)]
    pub ew: usize,
    /// Stride between elements in bytes.
    #[arg(long, default_value_t = 16)]
    pub stride: i64,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Strided load/store round trip over VPU memory.
    Demo(DemoArgs),
}
