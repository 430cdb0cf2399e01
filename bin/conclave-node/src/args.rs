use std::path::PathBuf;

use argh::FromArgs;

#[derive(Debug, Clone, FromArgs)]
#[argh(description = "Conclave delegated-BFT ledger node")]
pub struct Args {
    #[argh(option, short = 'c', description = "path to JSON configuration")]
    pub config: PathBuf,

    #[argh(
        option,
        short = 'd',
        description = "data directory for the storage engine"
    )]
    pub data_dir: Option<PathBuf>,
}
