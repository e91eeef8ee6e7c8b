//! Scan a binary for instruction sequences whose loads can be steered by an injected value.
//!
//! The scan is a byte-pattern heuristic, not a disassembler pass: every offset is tested
//! with a 32-byte lookahead window, and a hit only marks the offset as a race candidate.
use std::{fmt, fs::File, path::Path};

use anyhow::{bail, Context};
use iced_x86::{Decoder, DecoderOptions, Formatter, Instruction, IntelFormatter};
use memmap2::Mmap;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Lookahead window tested at every offset.
pub const SCAN_WINDOW: usize = 32;
/// Bytes recorded (and disassembled) per candidate.
pub const GADGET_LENGTH: usize = 16;
/// Offsets skipped after a hit, on top of the regular advance.
const SKIP_AFTER_HIT: usize = 8;
const DEFAULT_SCORE: f64 = 0.5;
/// Candidates printed by `log_summary`.
const SUMMARY_LEN: usize = 10;

/// The byte pattern that flagged a window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadPattern {
    /// REX.W prefix with XCHG or an ADD/OR/ADC/SBB reading its source operand.
    RexWideOperand,
    /// `0F B6/B7/BE/BF`: zero or sign extending load.
    ExtendingLoad,
    /// REX prefix followed by `8A`/`8B`.
    RexMov,
}

impl fmt::Display for LoadPattern {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LoadPattern::RexWideOperand => write!(f, "REX_WIDE_OPERAND"),
            LoadPattern::ExtendingLoad => write!(f, "EXTENDING_LOAD"),
            LoadPattern::RexMov => write!(f, "REX_MOV"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Gadget {
    /// File offset of the window start.
    pub address: u64,
    pub length: usize,
    pub pattern: LoadPattern,
    #[serde(serialize_with = "hex_bytes")]
    pub bytes: Vec<u8>,
    pub disassembly: String,
    pub score: f64,
}

fn hex_bytes<S: serde::Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&hex::encode(bytes))
}

/// Candidates found in one binary, tied to its content hash.
#[derive(Clone, Debug, Serialize)]
pub struct GadgetScan {
    pub path: String,
    pub size: usize,
    pub sha256: String,
    pub gadgets: Vec<Gadget>,
}

impl GadgetScan {
    pub fn len(&self) -> usize {
        self.gadgets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gadgets.is_empty()
    }

    pub fn log_summary(&self) {
        info!(
            "{} candidate(s) in {} ({} bytes, sha256 {})",
            self.gadgets.len(),
            self.path,
            self.size,
            self.sha256
        );
        for gadget in self.gadgets.iter().take(SUMMARY_LEN) {
            info!(
                "[0x{:016x}] {} score {:.2}: {}",
                gadget.address,
                gadget.pattern,
                gadget.score,
                hex::encode(&gadget.bytes)
            );
            debug!("    {}", gadget.disassembly);
        }
        if self.gadgets.len() > SUMMARY_LEN {
            info!("... and {} more", self.gadgets.len() - SUMMARY_LEN);
        }
    }
}

/// Match the load patterns anywhere in `window`.
pub fn match_window(window: &[u8]) -> Option<LoadPattern> {
    let len = window.len();
    if len < 2 {
        return None;
    }
    for i in 0..len - 1 {
        let (b0, b1) = (window[i], window[i + 1]);
        if b0 & 0xF8 == 0x48 {
            if b1 & 0xC7 == 0x87 {
                return Some(LoadPattern::RexWideOperand);
            }
            if matches!(b1 & 0xC7, 0x03 | 0x0B | 0x13 | 0x1B) {
                return Some(LoadPattern::RexWideOperand);
            }
        }
        if b0 == 0x0F && matches!(b1, 0xB6 | 0xB7 | 0xBE | 0xBF) {
            return Some(LoadPattern::ExtendingLoad);
        }
        if b0 & 0xF0 == 0x40 && i + 2 < len && matches!(b1, 0x8A | 0x8B) {
            return Some(LoadPattern::RexMov);
        }
    }
    None
}

/// Intel-syntax disassembly of `bytes` decoded at `ip`, instructions joined by `; `.
pub fn disassemble(bytes: &[u8], ip: u64) -> String {
    let mut decoder = Decoder::with_ip(64, bytes, ip, DecoderOptions::NONE);
    let mut formatter = IntelFormatter::new();
    let mut instruction = Instruction::default();
    let mut parts = Vec::new();
    while decoder.can_decode() {
        decoder.decode_out(&mut instruction);
        if instruction.is_invalid() {
            parts.push("(bad)".to_string());
            continue;
        }
        let mut out = String::new();
        formatter.format(&instruction, &mut out);
        parts.push(out);
    }
    parts.join("; ")
}

/// Slide the lookahead window over `data`. Only offsets with a full window are tested.
pub fn scan_bytes(data: &[u8]) -> Vec<Gadget> {
    let mut gadgets = Vec::new();
    if data.len() <= SCAN_WINDOW {
        return gadgets;
    }
    let end = data.len() - SCAN_WINDOW;
    let mut offset = 0;
    while offset < end {
        if let Some(pattern) = match_window(&data[offset..offset + SCAN_WINDOW]) {
            let bytes = data[offset..offset + GADGET_LENGTH].to_vec();
            gadgets.push(Gadget {
                address: offset as u64,
                length: GADGET_LENGTH,
                pattern,
                disassembly: disassemble(&bytes, offset as u64),
                bytes,
                score: DEFAULT_SCORE,
            });
            offset += SKIP_AFTER_HIT;
        }
        offset += 1;
    }
    gadgets
}

/// Memory-map `path`, hash it and scan it.
///
/// Fails if the file cannot be read or contains no candidate at all.
pub fn scan_binary<P: AsRef<Path>>(path: P) -> anyhow::Result<GadgetScan> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let size = file.metadata()?.len() as usize;
    if size == 0 {
        bail!("{} is empty", path.display());
    }
    // SAFETY: read-only private mapping; concurrent truncation of the target is not handled
    let map = unsafe { Mmap::map(&file) }.with_context(|| format!("mmap {}", path.display()))?;
    info!("Scanning binary: {} ({} bytes)", path.display(), size);

    let sha256 = hex::encode(Sha256::digest(&map[..]));
    let gadgets = scan_bytes(&map);
    if gadgets.is_empty() {
        bail!("No candidates found in {}", path.display());
    }
    info!("Found {} potential candidates", gadgets.len());
    Ok(GadgetScan {
        path: path.display().to_string(),
        size,
        sha256,
        gadgets,
    })
}
