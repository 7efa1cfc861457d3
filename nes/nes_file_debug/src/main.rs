//! `nes_file_debug` takes the path to a .nes file, decodes it and then
//! prints every header field and segment size.
use std::fs::read;

use clap::Parser;

use color_eyre::eyre::Result;
use nes_file::DecodeOptions;
use serde_json::{Map, Value};

/// `nes_file_debug` will decode the given .nes file and print its contents.
#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    #[arg(help = "Filename containing .nes data")]
    filename: String,

    #[arg(
        help = "Use the recommended iNES/NES 2.0 detection procedure instead of trusting the flags 7 dialect bits",
        long
    )]
    strict: bool,

    #[arg(help = "Print the decoded fields as a JSON object", long)]
    json: bool,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::init(); // Log to stderr (if you run with `RUST_LOG=debug`).
    let args: Args = Args::parse();

    let bytes: Vec<u8> = read(&args.filename)?;
    log::debug!("read {} bytes from {}", bytes.len(), args.filename);

    let options = DecodeOptions {
        strict_dialect_detection: args.strict,
    };
    let image = nes_file::decode_with(&bytes, &options)?;

    if args.json {
        let mut obj = Map::new();
        obj.insert("file".into(), Value::String(args.filename));
        obj.insert("file_size".into(), Value::from(bytes.len()));
        for (name, value) in image.rows() {
            obj.insert(name.into(), Value::String(value));
        }
        println!("{}", serde_json::to_string_pretty(&Value::Object(obj))?);
        return Ok(());
    }

    println!(
        "NES data for {} ({} bytes)\n{image}",
        args.filename,
        bytes.len()
    );
    Ok(())
}
