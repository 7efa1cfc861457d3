//! `nes_file_survey` decodes every .nes file under a directory and reports
//! how many use each mapper/submapper.
use std::path::Path;

use clap::Parser;

use color_eyre::eyre::Result;
use nes_file::DecodeOptions;
use nes_file_survey::{Survey, DEFAULT_ALLOW_BAD};

/// `nes_file_survey` walks the given directory decoding all .nes files.
#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    #[arg(help = "Directory to search for .nes files", long, default_value = "roms")]
    dir: String,

    #[arg(
        help = "Filename substring whose decode failures are tolerated (can be specified N times, replaces the built in list)",
        long
    )]
    allow_bad: Vec<String>,

    #[arg(
        help = "Use the recommended iNES/NES 2.0 detection procedure instead of trusting the flags 7 dialect bits",
        long
    )]
    strict: bool,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args: Args = Args::parse();

    let mut survey = Survey::new(DecodeOptions {
        strict_dialect_detection: args.strict,
    });
    if !args.allow_bad.is_empty() {
        survey.allow_bad = args.allow_bad;
    }
    log::debug!(
        "allowing failures for {:?} (built in {DEFAULT_ALLOW_BAD:?})",
        survey.allow_bad
    );

    let report = survey.run(Path::new(&args.dir))?;
    print!("{report}");
    Ok(())
}
