//! `nes_file` decodes a .nes cartridge image into its header fields and the
//! raw data segments (trainer, PRG ROM, CHR ROM and any trailing data).
//!
//! It handles archaic iNES, iNES and NES 2.0 headers as described in
//! <https://www.nesdev.org/wiki/INES> and <https://www.nesdev.org/wiki/NES_2.0>.
//! UNIF containers are recognized but not decoded.
//!
//! Every segment in a decoded [`CartridgeImage`] borrows from the input
//! buffer. Nothing is copied, so the image can't outlive the data it came from.

use std::fmt::{self, Debug, Display};
use strum_macros::{Display, EnumCount, EnumIter};
use thiserror::Error;


/// Size of the fixed header at the start of every .nes file.
pub const HEADER_SIZE: usize = 16;

/// Size of the optional trainer which sits between the header and PRG ROM.
pub const TRAINER_SIZE: usize = 512;

const MAGIC_SIZE: usize = 4;
const UNIF_MAGIC: u32 = 0x554E_4946;
const NES_MAGIC: u32 = 0x4E45_531A;

const PRG_BLOCK_SIZE: usize = 16_384;
const CHR_BLOCK_SIZE: usize = 8_192;
const PRG_RAM_BLOCK_SIZE: usize = 8_192;

const PRG_BYTE: usize = 4;
const CHR_BYTE: usize = 5;
const FLAGS_6_BYTE: usize = 6;
const FLAGS_7_BYTE: usize = 7;
const MAPPER_BYTE: usize = 8;
const PRG_RAM_BYTE: usize = 8;
const FLAGS_9_BYTE: usize = 9;
const PRG_CHR_MSB_BYTE: usize = 9;
const FLAGS_10_BYTE: usize = 10;
const PRG_RAM_SHIFT_BYTE: usize = 10;
const CHR_RAM_SHIFT_BYTE: usize = 11;
const TIMING_BYTE: usize = 12;
const SYSTEMS_BYTE: usize = 13;
const MISC_ROMS_BYTE: usize = 14;
const RESERVED_BYTE: usize = 15;

const MIRROR_MASK: u8 = 0x01;
const BATTERY_MASK: u8 = 0x02;
const TRAINER_MASK: u8 = 0x04;
const FOUR_SCREEN_MASK: u8 = 0x08;
const MAPPER_D0_D3_MASK: u8 = 0xF0;
const MAPPER_D0_D3_SHIFT: u8 = 4;

const VS_UNISYSTEM_MASK: u8 = 0x01;
const PLAYCHOICE_10_MASK: u8 = 0x02;
const CART_TYPE_MASK: u8 = 0x0C;
const NES20_CART_SIG: u8 = 0x08;
const INES_CART_SIG: u8 = 0x00;
const MAPPER_D4_D7_MASK: u8 = 0xF0;

const SUBMAPPER_MASK: u8 = 0x0F;
const MAPPER_D8_D11_SHIFT: u16 = 8;

const PRG_ROM_MSB_MASK: u8 = 0x0F;
const CHR_ROM_MSB_MASK: u8 = 0xF0;
const CHR_ROM_MSB_SHIFT: u8 = 4;
const ROM_MSB_SHIFT: usize = 8;

const INES_TV_MASK: u8 = 0x01;
const INES_RESERVED_9_SHIFT: u8 = 1;
const INES_TV_CODE_MASK: u8 = 0x03;
const PRG_RAM_PRESENT_MASK: u8 = 0x10;
const BUS_CONFLICT_MASK: u8 = 0x20;

const LOW_NIBBLE_MASK: u8 = 0x0F;
const HIGH_NIBBLE_SHIFT: u8 = 4;

const TIMING_PAL_MASK: u8 = 0x01;
const TIMING_BOTH_MASK: u8 = 0x02;
const VS_PPU_MASK: u8 = 0x0F;
const VS_MODE_SHIFT: u8 = 4;
const MISC_ROMS_MASK: u8 = 0x03;

const EXPONENT_BASE_SHIFT: u8 = 6;
const EXPONENT_RESERVED: u8 = 0x0F;

/// `DecodeError` classifies every way decoding can fail. None of these
/// are retried; the caller decides what to do with a bad image.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    /// The buffer ends before the magic number or the header is complete.
    #[error("data is only {len} bytes but at least {need} are required")]
    TooShort {
        /// Length of the supplied buffer.
        len: usize,
        /// Length needed to continue decoding.
        need: usize,
    },

    /// The first 4 bytes are neither `NES<EOF>` nor `UNIF`.
    #[error("not a .nes file (bad magic {magic:08X})")]
    BadMagic {
        /// The big endian word read from bytes 0-3.
        magic: u32,
    },

    /// An exponential size nibble holds 15 which the format leaves undefined.
    #[error("reserved value {nibble} in exponential size field")]
    ReservedSizeValue {
        /// The offending nibble.
        nibble: u8,
    },

    /// The trainer flag is set but fewer than 512 bytes follow the header.
    /// Reported ahead of [`DecodeError::TruncatedPrgRom`] since PRG ROM
    /// starts after the trainer.
    #[error("trainer bad read: {have} != {}", TRAINER_SIZE)]
    TruncatedTrainer {
        /// Bytes available after the header.
        have: usize,
    },

    /// Fewer bytes remain than the header declares for PRG ROM.
    #[error("PRG ROM bad read: {have} != {want}")]
    TruncatedPrgRom {
        /// Declared PRG ROM size.
        want: usize,
        /// Bytes actually available.
        have: usize,
    },

    /// Fewer bytes remain than the header declares for CHR ROM.
    #[error("CHR ROM bad read: {have} != {want}")]
    TruncatedChrRom {
        /// Declared CHR ROM size.
        want: usize,
        /// Bytes actually available.
        have: usize,
    },

    /// A declared ROM size doesn't fit in a `usize` on this host.
    #[error("declared ROM size overflows the address space")]
    RomSizeOverflow,
}

/// `DecodeOptions` tunes how the decoder resolves ambiguous headers.
/// The default treats the flags 7 dialect bits as authoritative.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DecodeOptions {
    /// Apply the recommended detection procedure from the iNES wiki page:
    /// NES 2.0 only if the extended ROM sizes fit in the data and iNES only
    /// if bytes 12-15 are zero. Anything failing those checks is archaic iNES.
    pub strict_dialect_detection: bool,
}

/// The header dialect of a decoded image. Exactly one applies.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, EnumCount, EnumIter)]
pub enum Dialect {
    /// UNIF container, detected only.
    #[strum(to_string = "UNIF")]
    Unif,

    /// Before there was a standard.
    #[strum(to_string = "archaic iNES")]
    ArchaicInes,

    /// iNES 1.0
    #[strum(to_string = "iNES")]
    Ines,

    /// NES 2.0
    #[strum(to_string = "NES 2.0")]
    Nes20,
}

/// Nametable mirroring
#[derive(Clone, Copy, Debug, Default, Display, PartialEq, Eq)]
pub enum Mirroring {
    /// Horizontal
    #[default]
    Horizontal,

    /// Vertical
    Vertical,
}

/// TV system (region) the cart expects.
#[derive(Clone, Copy, Debug, Default, Display, PartialEq, Eq)]
pub enum TvSystem {
    /// NTSC
    #[default]
    #[strum(to_string = "NTSC")]
    Ntsc,

    /// PAL
    #[strum(to_string = "PAL")]
    Pal,

    /// Runs on either region.
    #[strum(to_string = "both")]
    Both,
}

/// Vs system PPU model from the low nibble of NES 2.0 byte 13.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(non_camel_case_types)]
pub enum VsPpu {
    /// RP2C03B
    RP2C03B,
    /// RP2C03G
    RP2C03G,
    /// RP2C04-0001
    RP2C04_0001,
    /// RP2C04-0002
    RP2C04_0002,
    /// RP2C04-0003
    RP2C04_0003,
    /// RP2C04-0004
    RP2C04_0004,
    /// RC2C03B
    RC2C03B,
    /// RC2C03C
    RC2C03C,
    /// RC2C05-01
    RC2C05_01,
    /// RC2C05-02
    RC2C05_02,
    /// RC2C05-03
    RC2C05_03,
    /// RC2C05-04
    RC2C05_04,
    /// RC2C05-05
    RC2C05_05,
    /// Index 13-15, not assigned a model.
    Undefined(u8),
}

const VS_PPU_MODELS: [VsPpu; 16] = [
    VsPpu::RP2C03B,
    VsPpu::RP2C03G,
    VsPpu::RP2C04_0001,
    VsPpu::RP2C04_0002,
    VsPpu::RP2C04_0003,
    VsPpu::RP2C04_0004,
    VsPpu::RC2C03B,
    VsPpu::RC2C03C,
    VsPpu::RC2C05_01,
    VsPpu::RC2C05_02,
    VsPpu::RC2C05_03,
    VsPpu::RC2C05_04,
    VsPpu::RC2C05_05,
    VsPpu::Undefined(13),
    VsPpu::Undefined(14),
    VsPpu::Undefined(15),
];

impl VsPpu {
    /// Look up the model for a table index. Only the low nibble is used.
    #[must_use]
    pub fn from_index(index: u8) -> Self {
        VS_PPU_MODELS[usize::from(index & VS_PPU_MASK)]
    }
}

impl Display for VsPpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RP2C03B => "RP2C03B",
            Self::RP2C03G => "RP2C03G",
            Self::RP2C04_0001 => "RP2C04-0001",
            Self::RP2C04_0002 => "RP2C04-0002",
            Self::RP2C04_0003 => "RP2C04-0003",
            Self::RP2C04_0004 => "RP2C04-0004",
            Self::RC2C03B => "RC2C03B",
            Self::RC2C03C => "RC2C03C",
            Self::RC2C05_01 => "RC2C05-01",
            Self::RC2C05_02 => "RC2C05-02",
            Self::RC2C05_03 => "RC2C05-03",
            Self::RC2C05_04 => "RC2C05-04",
            Self::RC2C05_05 => "RC2C05-05",
            Self::Undefined(n) => return write!(f, "not defined ({n})"),
        };
        f.write_str(name)
    }
}

/// Bytes 8-10 as laid out by iNES and archaic iNES headers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InesFields {
    /// PRG RAM size in bytes (byte 8 in 8KB units).
    pub prg_ram_size: usize,

    /// TV system from flags 9 bit 0.
    pub tv_system: TvSystem,

    /// Flags 9 bits 1-7, kept as is.
    pub reserved9: u8,

    /// Flags 10 bits 0-1. 0 is NTSC, 2 is PAL and 1 or 3 is dual region.
    pub tv_system_code: u8,

    /// Flags 10 bit 4
    pub has_prg_ram: bool,

    /// Flags 10 bit 5
    pub has_bus_conflicts: bool,
}

impl InesFields {
    fn decode(header: &[u8; HEADER_SIZE]) -> Self {
        let flags9 = header[FLAGS_9_BYTE];
        let flags10 = header[FLAGS_10_BYTE];
        Self {
            prg_ram_size: usize::from(header[PRG_RAM_BYTE]) * PRG_RAM_BLOCK_SIZE,
            tv_system: if flags9 & INES_TV_MASK == 0x00 {
                TvSystem::Ntsc
            } else {
                TvSystem::Pal
            },
            reserved9: flags9 >> INES_RESERVED_9_SHIFT,
            tv_system_code: flags10 & INES_TV_CODE_MASK,
            has_prg_ram: flags10 & PRG_RAM_PRESENT_MASK != 0x00,
            has_bus_conflicts: flags10 & BUS_CONFLICT_MASK != 0x00,
        }
    }

    fn rows(&self, rows: &mut Vec<(&'static str, String)>) {
        rows.push(("prg_ram_size", self.prg_ram_size.to_string()));
        rows.push(("tv_system", self.tv_system.to_string()));
        rows.push(("reserved9", self.reserved9.to_string()));
        rows.push(("tv_system_code", self.tv_system_code.to_string()));
        rows.push(("has_prg_ram", self.has_prg_ram.to_string()));
        rows.push(("has_bus_conflicts", self.has_bus_conflicts.to_string()));
    }
}

/// Bytes 9-15 of a NES 2.0 header. Byte 8 feeds the mapper and submapper
/// on [`NesImage`] and the byte 9 size bits are already folded into the
/// ROM sizes there.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Nes20Fields {
    /// PRG RAM (not battery backed) in bytes.
    pub prg_ram_size: usize,

    /// PRG NVRAM (battery backed) in bytes.
    pub prg_nvram_size: usize,

    /// CHR RAM (not battery backed) in bytes.
    pub chr_ram_size: usize,

    /// CHR NVRAM (battery backed) in bytes.
    pub chr_nvram_size: usize,

    /// TV system from byte 12.
    pub tv_system: TvSystem,

    /// Vs system PPU
    pub vs_ppu: VsPpu,

    /// Vs mode from the high nibble of byte 13.
    pub vs_mode: u8,

    /// The number of misc ROMs following CHR ROM. They aren't sliced out
    /// individually and remain part of the trailer.
    pub misc_roms: u8,

    /// Byte 15, kept as is.
    pub reserved15: u8,
}

impl Nes20Fields {
    fn decode(header: &[u8; HEADER_SIZE]) -> Result<Self, DecodeError> {
        let prg_ram = header[PRG_RAM_SHIFT_BYTE];
        let chr_ram = header[CHR_RAM_SHIFT_BYTE];
        let timing = header[TIMING_BYTE];

        // Bit 1 wins over bit 0 so 0x03 is still dual region.
        let tv_system = if timing & TIMING_BOTH_MASK != 0x00 {
            TvSystem::Both
        } else if timing & TIMING_PAL_MASK != 0x00 {
            TvSystem::Pal
        } else {
            TvSystem::Ntsc
        };

        Ok(Self {
            prg_ram_size: exponential_size(prg_ram & LOW_NIBBLE_MASK)?,
            prg_nvram_size: exponential_size(prg_ram >> HIGH_NIBBLE_SHIFT)?,
            chr_ram_size: exponential_size(chr_ram & LOW_NIBBLE_MASK)?,
            chr_nvram_size: exponential_size(chr_ram >> HIGH_NIBBLE_SHIFT)?,
            tv_system,
            vs_ppu: VsPpu::from_index(header[SYSTEMS_BYTE]),
            vs_mode: header[SYSTEMS_BYTE] >> VS_MODE_SHIFT,
            misc_roms: header[MISC_ROMS_BYTE] & MISC_ROMS_MASK,
            reserved15: header[RESERVED_BYTE],
        })
    }

    fn rows(&self, rows: &mut Vec<(&'static str, String)>) {
        rows.push(("prg_ram_not_battery_backed", self.prg_ram_size.to_string()));
        rows.push(("prg_ram_is_battery_backed", self.prg_nvram_size.to_string()));
        rows.push(("chr_ram_not_battery_backed", self.chr_ram_size.to_string()));
        rows.push(("chr_ram_is_battery_backed", self.chr_nvram_size.to_string()));
        rows.push(("tv_system", self.tv_system.to_string()));
        rows.push(("vs_ppu", self.vs_ppu.to_string()));
        rows.push(("vs_mode", self.vs_mode.to_string()));
        rows.push(("extra_roms", self.misc_roms.to_string()));
        rows.push(("reserved15", self.reserved15.to_string()));
    }
}

/// The dialect specific part of a header. Holding these as one enum means
/// an image can never carry both iNES and NES 2.0 fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DialectFields {
    /// Archaic iNES, decoded with the iNES byte 8-10 layout.
    ArchaicInes(InesFields),

    /// iNES 1.0
    Ines(InesFields),

    /// NES 2.0
    Nes20(Nes20Fields),
}

impl DialectFields {
    /// The dialect these fields were decoded under.
    #[must_use]
    pub fn dialect(&self) -> Dialect {
        match self {
            Self::ArchaicInes(_) => Dialect::ArchaicInes,
            Self::Ines(_) => Dialect::Ines,
            Self::Nes20(_) => Dialect::Nes20,
        }
    }
}

/// A decoded .nes image. All slices borrow from the buffer passed to
/// [`decode`].
#[derive(Clone, PartialEq, Eq)]
pub struct NesImage<'a> {
    /// PRG ROM size in bytes.
    pub prg_rom_size: usize,

    /// CHR ROM size in bytes.
    pub chr_rom_size: usize,

    /// Set when byte 5 is zero, meaning the board uses CHR RAM instead.
    pub has_chr_ram: bool,

    /// Nametable mirroring
    pub mirroring: Mirroring,

    /// Battery backed SRAM present.
    pub has_battery_backed_sram: bool,

    /// Trainer present. When set `trainer` is always `Some`.
    pub has_trainer: bool,

    /// 4 screen mode
    pub four_screen_mode: bool,

    /// Vs Unisystem
    pub is_vs_unisystem: bool,

    /// PlayChoice-10
    pub is_playchoice10: bool,

    /// Mapper number, up to 12 bits under NES 2.0.
    pub mapper: u16,

    /// Sub mapper, NES 2.0 only.
    pub submapper: Option<u8>,

    /// Dialect specific fields.
    pub fields: DialectFields,

    /// The raw header.
    pub header: &'a [u8; HEADER_SIZE],

    /// Optional trainer data.
    pub trainer: Option<&'a [u8]>,

    /// PRG ROM, exactly `prg_rom_size` bytes.
    pub prg_rom: &'a [u8],

    /// CHR ROM, exactly `chr_rom_size` bytes.
    pub chr_rom: &'a [u8],

    /// Anything after CHR ROM. PlayChoice INST-ROM/PROM, a title, misc ROMs
    /// or nothing at all.
    pub trailer: &'a [u8],
}

impl NesImage<'_> {
    /// The header dialect this image was decoded under.
    #[must_use]
    pub fn dialect(&self) -> Dialect {
        self.fields.dialect()
    }
}

impl Debug for NesImage<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NesImage")
            .field("prg_rom_size", &self.prg_rom_size)
            .field("chr_rom_size", &self.chr_rom_size)
            .field("has_chr_ram", &self.has_chr_ram)
            .field("mirroring", &self.mirroring)
            .field("has_battery_backed_sram", &self.has_battery_backed_sram)
            .field("has_trainer", &self.has_trainer)
            .field("four_screen_mode", &self.four_screen_mode)
            .field("is_vs_unisystem", &self.is_vs_unisystem)
            .field("is_playchoice10", &self.is_playchoice10)
            .field("mapper", &self.mapper)
            .field("submapper", &self.submapper)
            .field("fields", &self.fields)
            .field("header", &self.header)
            // Segments can be megabytes so only print their length.
            .field("trainer", &self.trainer.map(<[u8]>::len))
            .field("prg_rom", &self.prg_rom.len())
            .field("chr_rom", &self.chr_rom.len())
            .field("trailer", &self.trailer.len())
            .finish()
    }
}

/// The result of decoding a buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CartridgeImage<'a> {
    /// A UNIF container. Recognized but not decoded further.
    Unif,

    /// An archaic iNES, iNES or NES 2.0 image.
    Nes(NesImage<'a>),
}

impl<'a> CartridgeImage<'a> {
    /// The header dialect of this image.
    #[must_use]
    pub fn dialect(&self) -> Dialect {
        match self {
            Self::Unif => Dialect::Unif,
            Self::Nes(nes) => nes.dialect(),
        }
    }

    /// The decoded NES image unless this is UNIF.
    #[must_use]
    pub fn nes(&self) -> Option<&NesImage<'a>> {
        match self {
            Self::Unif => None,
            Self::Nes(nes) => Some(nes),
        }
    }

    /// Every decoded field as a name/value row in header order. Raw segments
    /// are rendered as their byte count rather than their content.
    #[must_use]
    pub fn rows(&self) -> Vec<(&'static str, String)> {
        let mut rows = vec![("dialect", self.dialect().to_string())];
        let Self::Nes(nes) = self else {
            return rows;
        };

        rows.push(("prg_rom_size", nes.prg_rom_size.to_string()));
        rows.push(("chr_rom_size", nes.chr_rom_size.to_string()));
        rows.push(("has_chr_ram", nes.has_chr_ram.to_string()));
        rows.push(("mirroring", nes.mirroring.to_string()));
        rows.push((
            "has_battery_backed_sram",
            nes.has_battery_backed_sram.to_string(),
        ));
        rows.push(("has_trainer", nes.has_trainer.to_string()));
        rows.push(("four_screen_mode", nes.four_screen_mode.to_string()));
        rows.push(("is_vs_unisystem", nes.is_vs_unisystem.to_string()));
        rows.push(("is_playchoice10", nes.is_playchoice10.to_string()));
        rows.push(("mapper", nes.mapper.to_string()));
        if let Some(submapper) = nes.submapper {
            rows.push(("submapper", submapper.to_string()));
        }
        match &nes.fields {
            DialectFields::ArchaicInes(f) | DialectFields::Ines(f) => f.rows(&mut rows),
            DialectFields::Nes20(f) => f.rows(&mut rows),
        }
        rows.push(("header", byte_count(nes.header)));
        if let Some(trainer) = nes.trainer {
            rows.push(("trainer", byte_count(trainer)));
        }
        rows.push(("prg_rom", byte_count(nes.prg_rom)));
        rows.push(("chr_rom", byte_count(nes.chr_rom)));
        rows.push(("trailer", byte_count(nes.trailer)));
        rows
    }
}

fn byte_count(segment: &[u8]) -> String {
    format!("{} bytes", segment.len())
}

impl Display for CartridgeImage<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in self.rows() {
            writeln!(f, "{name:>26}: {value}")?;
        }
        Ok(())
    }
}

/// Decode a NES 2.0 exponential size nibble (bytes 10 and 11) into bytes.
/// 0 means none, 15 is reserved and everything else is `64 << n`.
///
/// # Errors
/// A nibble of 15 (or anything not fitting in 4 bits) returns
/// [`DecodeError::ReservedSizeValue`].
pub fn exponential_size(nibble: u8) -> Result<usize, DecodeError> {
    match nibble {
        0 => Ok(0),
        n if n < EXPONENT_RESERVED => Ok(1 << (EXPONENT_BASE_SHIFT + n)),
        _ => Err(DecodeError::ReservedSizeValue { nibble }),
    }
}

/// Classify a header by the dialect bits (2-3) of flags 7. This never
/// returns [`Dialect::Unif`], that's decided by the magic number.
#[must_use]
pub fn classify(flags7: u8) -> Dialect {
    match flags7 & CART_TYPE_MASK {
        NES20_CART_SIG => Dialect::Nes20,
        INES_CART_SIG => Dialect::Ines,
        _ => Dialect::ArchaicInes,
    }
}

/// Build the mapper number and optional submapper from every byte that
/// contributes to them.
///
/// Flags 6 supplies bits 0-3 from its high nibble. Flags 7 is OR'd in as is
/// so its high nibble lands on bits 4-7. Under NES 2.0 the high nibble of
/// byte 8 becomes bits 8-11 and the low nibble is the submapper.
#[must_use]
pub fn assemble_mapper(flags6: u8, flags7: u8, byte8: u8, dialect: Dialect) -> (u16, Option<u8>) {
    let mut mapper = u16::from((flags6 & MAPPER_D0_D3_MASK) >> MAPPER_D0_D3_SHIFT);
    mapper |= u16::from(flags7 & MAPPER_D4_D7_MASK);
    if dialect != Dialect::Nes20 {
        return (mapper, None);
    }
    mapper |= u16::from(byte8 >> HIGH_NIBBLE_SHIFT) << MAPPER_D8_D11_SHIFT;
    (mapper, Some(byte8 & SUBMAPPER_MASK))
}

/// Decode a buffer with the default [`DecodeOptions`].
///
/// # Errors
/// See [`decode_with`].
pub fn decode(data: &[u8]) -> Result<CartridgeImage<'_>, DecodeError> {
    decode_with(data, &DecodeOptions::default())
}

/// Decode a buffer into a [`CartridgeImage`]. A UNIF magic returns
/// [`CartridgeImage::Unif`] without reading anything past byte 3.
///
/// # Errors
/// A short buffer, bad magic, reserved NES 2.0 size nibble or a trainer/PRG/CHR
/// segment extending past the end of the data all return a [`DecodeError`].
pub fn decode_with<'a>(
    data: &'a [u8],
    options: &DecodeOptions,
) -> Result<CartridgeImage<'a>, DecodeError> {
    let magic = data.first_chunk::<MAGIC_SIZE>().ok_or(DecodeError::TooShort {
        len: data.len(),
        need: MAGIC_SIZE,
    })?;
    match u32::from_be_bytes(*magic) {
        UNIF_MAGIC => return Ok(CartridgeImage::Unif),
        NES_MAGIC => {}
        magic => return Err(DecodeError::BadMagic { magic }),
    }

    let header = data
        .first_chunk::<HEADER_SIZE>()
        .ok_or(DecodeError::TooShort {
            len: data.len(),
            need: HEADER_SIZE,
        })?;

    let flags6 = header[FLAGS_6_BYTE];
    let flags7 = header[FLAGS_7_BYTE];
    let has_trainer = flags6 & TRAINER_MASK != 0x00;

    let dialect = if options.strict_dialect_detection {
        detect_strict(header, data.len())
    } else {
        classify(flags7)
    };

    let (mapper, submapper) = assemble_mapper(flags6, flags7, header[MAPPER_BYTE], dialect);
    let (prg_rom_size, chr_rom_size) = rom_sizes(header, dialect)?;

    let fields = match dialect {
        Dialect::Nes20 => DialectFields::Nes20(Nes20Fields::decode(header)?),
        Dialect::Ines => DialectFields::Ines(InesFields::decode(header)),
        // UNIF returned above on the magic so it can't reach here.
        Dialect::ArchaicInes | Dialect::Unif => {
            DialectFields::ArchaicInes(InesFields::decode(header))
        }
    };

    let mut prg_start = HEADER_SIZE;
    let trainer = if has_trainer {
        let trainer = segment(data, HEADER_SIZE, TRAINER_SIZE).ok_or(
            DecodeError::TruncatedTrainer {
                have: data.len() - HEADER_SIZE,
            },
        )?;
        prg_start += TRAINER_SIZE;
        Some(trainer)
    } else {
        None
    };

    let prg_rom =
        segment(data, prg_start, prg_rom_size).ok_or(DecodeError::TruncatedPrgRom {
            want: prg_rom_size,
            have: data.len().saturating_sub(prg_start),
        })?;

    // segment() succeeding means these offsets are all within data.len().
    let chr_start = prg_start + prg_rom_size;
    let chr_rom =
        segment(data, chr_start, chr_rom_size).ok_or(DecodeError::TruncatedChrRom {
            want: chr_rom_size,
            have: data.len() - chr_start,
        })?;
    let trailer = &data[chr_start + chr_rom_size..];

    Ok(CartridgeImage::Nes(NesImage {
        prg_rom_size,
        chr_rom_size,
        has_chr_ram: header[CHR_BYTE] == 0x00,
        mirroring: if flags6 & MIRROR_MASK == 0x00 {
            Mirroring::Horizontal
        } else {
            Mirroring::Vertical
        },
        has_battery_backed_sram: flags6 & BATTERY_MASK != 0x00,
        has_trainer,
        four_screen_mode: flags6 & FOUR_SCREEN_MASK != 0x00,
        is_vs_unisystem: flags7 & VS_UNISYSTEM_MASK != 0x00,
        is_playchoice10: flags7 & PLAYCHOICE_10_MASK != 0x00,
        mapper,
        submapper,
        fields,
        header,
        trainer,
        prg_rom,
        chr_rom,
        trailer,
    }))
}

// Slice len bytes at start or None if data ends first.
fn segment(data: &[u8], start: usize, len: usize) -> Option<&[u8]> {
    data.get(start..start.checked_add(len)?)
}

// PRG and CHR ROM sizes in bytes. NES 2.0 ORs the byte 9 nibbles into
// bits 8-11 of each size.
fn rom_sizes(
    header: &[u8; HEADER_SIZE],
    dialect: Dialect,
) -> Result<(usize, usize), DecodeError> {
    let mut prg = usize::from(header[PRG_BYTE])
        .checked_mul(PRG_BLOCK_SIZE)
        .ok_or(DecodeError::RomSizeOverflow)?;
    let mut chr = usize::from(header[CHR_BYTE])
        .checked_mul(CHR_BLOCK_SIZE)
        .ok_or(DecodeError::RomSizeOverflow)?;
    if dialect == Dialect::Nes20 {
        let msb = header[PRG_CHR_MSB_BYTE];
        prg |= usize::from(msb & PRG_ROM_MSB_MASK) << ROM_MSB_SHIFT;
        chr |= usize::from((msb & CHR_ROM_MSB_MASK) >> CHR_ROM_MSB_SHIFT) << ROM_MSB_SHIFT;
    }
    Ok((prg, chr))
}

// The detection procedure recommended on the iNES wiki page. The dialect
// bits still decide first; the extra checks can only demote to archaic.
fn detect_strict(header: &[u8; HEADER_SIZE], len: usize) -> Dialect {
    match classify(header[FLAGS_7_BYTE]) {
        Dialect::Nes20 => {
            let mut start = HEADER_SIZE;
            if header[FLAGS_6_BYTE] & TRAINER_MASK != 0x00 {
                start += TRAINER_SIZE;
            }
            let fits = rom_sizes(header, Dialect::Nes20)
                .ok()
                .and_then(|(prg, chr)| start.checked_add(prg)?.checked_add(chr))
                .is_some_and(|end| end <= len);
            if fits {
                Dialect::Nes20
            } else {
                Dialect::ArchaicInes
            }
        }
        Dialect::Ines if header[TIMING_BYTE..=RESERVED_BYTE] != [0, 0, 0, 0] => {
            Dialect::ArchaicInes
        }
        dialect => dialect,
    }
}
