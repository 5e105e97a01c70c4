use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use ingestforge::task::{ExistOption, VerifyOption};

#[derive(Parser)]
#[command(name = "ingestforge")]
#[command(author, version, about = "Ingest task orchestration engine")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Copy a source tree into the library, tracking progress to completion
    Ingest {
        /// Source file or directory
        #[arg(required = true)]
        source: PathBuf,

        /// Destination directory
        #[arg(required = true)]
        dest: PathBuf,

        /// Post-copy verification level
        #[arg(long, value_enum, default_value_t = VerifyArg::None)]
        verify: VerifyArg,

        /// What to do when a destination file already exists
        #[arg(long, value_enum, default_value_t = ExistArg::Skip)]
        exist: ExistArg,

        /// Queue an import for every copied file
        #[arg(long)]
        import: bool,
    },

    /// Validate configuration file
    Validate {
        /// Config file to validate (uses default if not specified)
        config: Option<PathBuf>,
    },

    /// Display version information
    Version,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum VerifyArg {
    None,
    Size,
    Content,
    Hash,
}

impl From<VerifyArg> for VerifyOption {
    fn from(arg: VerifyArg) -> Self {
        match arg {
            VerifyArg::None => VerifyOption::None,
            VerifyArg::Size => VerifyOption::Size,
            VerifyArg::Content => VerifyOption::Content,
            VerifyArg::Hash => VerifyOption::Hash,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExistArg {
    Replace,
    Rename,
    Skip,
}

impl From<ExistArg> for ExistOption {
    fn from(arg: ExistArg) -> Self {
        match arg {
            ExistArg::Replace => ExistOption::Replace,
            ExistArg::Rename => ExistOption::Rename,
            ExistArg::Skip => ExistOption::Skip,
        }
    }
}
