//! `nes_file_survey` walks a directory tree of .nes files, decodes each one
//! and tallies how often every mapper/submapper pair shows up.
//!
//! Verified good dumps carry `[!]` in their filename. Decode failures on
//! anything else are expected and only logged. A failure on a verified dump
//! stops the survey unless the filename is on the allow list.

use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::fs::{read, read_dir};
use std::path::{Path, PathBuf};

use color_eyre::eyre::{eyre, Result, WrapErr};
use nes_file::{CartridgeImage, DecodeOptions};


/// Verified dumps which are known to have shorter CHR ROM than declared.
pub const DEFAULT_ALLOW_BAD: [&str; 2] = ["Famicom Wars (J) [!].nes", "Yoshi (U) [!].nes"];

const GOOD_DUMP_MARKER: &str = "[!]";
const EXTENSION: &str = ".nes";

/// Return every .nes file (case insensitive) under `dir` in sorted order.
///
/// # Errors
/// Any directory which can't be read returns an error.
pub fn find_roms(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    walk(dir, &mut out)?;
    out.sort();
    Ok(out)
}

fn walk(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in read_dir(dir).wrap_err_with(|| format!("reading {}", dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        // file_type() doesn't follow symlinks so a linked directory can't loop.
        if entry.file_type()?.is_dir() {
            walk(&path, out)?;
        } else if path
            .to_string_lossy()
            .to_lowercase()
            .ends_with(EXTENSION)
        {
            out.push(path);
        }
    }
    Ok(())
}

/// Key for the mapper table. Renders as `mapper:submapper` with `-` for
/// images which have no submapper.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct MapperKey {
    /// Mapper number
    pub mapper: u16,
    /// Sub mapper, NES 2.0 only.
    pub submapper: Option<u8>,
}

impl Display for MapperKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.submapper {
            Some(s) => write!(f, "{}:{s}", self.mapper),
            None => write!(f, "{}:-", self.mapper),
        }
    }
}

/// Aggregate results of a survey.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Report {
    /// Images decoded successfully (UNIF excluded).
    pub parsed: usize,

    /// Tolerated decode failures.
    pub failed: usize,

    /// UNIF containers skipped.
    pub unif: usize,

    /// Image count per mapper/submapper.
    pub mappers: BTreeMap<MapperKey, usize>,
}

impl Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Parsed {} files, failed {}, skipped {} UNIF",
            self.parsed, self.failed, self.unif
        )?;
        for (key, count) in &self.mappers {
            writeln!(f, "{:>8}: {count}", key.to_string())?;
        }
        Ok(())
    }
}

/// `Survey` holds the settings for a run over a directory tree.
#[derive(Debug, Default)]
pub struct Survey {
    /// Decoder configuration applied to every file.
    pub options: DecodeOptions,

    /// Filename substrings whose failures are tolerated even on verified dumps.
    pub allow_bad: Vec<String>,
}

impl Survey {
    /// A survey with default decode options and [`DEFAULT_ALLOW_BAD`].
    #[must_use]
    pub fn new(options: DecodeOptions) -> Self {
        Self {
            options,
            allow_bad: DEFAULT_ALLOW_BAD.iter().map(ToString::to_string).collect(),
        }
    }

    /// Whether a decode failure for `path` is expected.
    #[must_use]
    pub fn is_known_bad(&self, path: &Path) -> bool {
        let p = path.to_string_lossy();
        !p.contains(GOOD_DUMP_MARKER) || self.allow_bad.iter().any(|a| p.contains(a.as_str()))
    }

    /// Decode one image and fold it into `report`.
    ///
    /// # Errors
    /// A decode failure which isn't known bad returns the error with the path attached.
    pub fn record(&self, report: &mut Report, path: &Path, data: &[u8]) -> Result<()> {
        log::info!("Parsing {}", path.display());
        match nes_file::decode_with(data, &self.options) {
            Ok(CartridgeImage::Unif) => {
                log::info!("{}: UNIF not supported, skipping", path.display());
                report.unif += 1;
            }
            Ok(CartridgeImage::Nes(nes)) => {
                log::info!(
                    "Mapper: {}, PRG ROM: {}, CHR ROM: {}, trailer {}",
                    nes.mapper,
                    nes.prg_rom_size,
                    nes.chr_rom_size,
                    nes.trailer.len()
                );
                let key = MapperKey {
                    mapper: nes.mapper,
                    submapper: nes.submapper,
                };
                *report.mappers.entry(key).or_default() += 1;
                report.parsed += 1;
            }
            Err(e) if self.is_known_bad(path) => {
                log::warn!("{}: {e}", path.display());
                report.failed += 1;
            }
            Err(e) => {
                log::error!("{}: {e}", path.display());
                return Err(eyre!("{}: {e}", path.display()));
            }
        }
        Ok(())
    }

    /// Decode every .nes file under `dir`.
    ///
    /// # Errors
    /// Unreadable directories/files and failures on verified dumps stop the
    /// survey and return an error.
    pub fn run(&self, dir: &Path) -> Result<Report> {
        let mut report = Report::default();
        for path in find_roms(dir)? {
            let data = read(&path).wrap_err_with(|| format!("reading {}", path.display()))?;
            self.record(&mut report, &path, &data)?;
        }
        Ok(report)
    }
}
