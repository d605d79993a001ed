use crate::error::{Result, UsmError};

pub const VIDEO_KEY_SIZE: usize = 0x40;
pub const AUDIO_KEY_SIZE: usize = 0x20;

/// Key seed used by the game's asset pipeline
pub const DEFAULT_KEY: u64 = 0x7F45_5149_9DF5_5E68;

/// Odd audio key bytes cycle through this template
const AUDIO_TEMPLATE: &[u8; 4] = b"URUC";

/// Video and audio keys expanded from one 64-bit seed
#[derive(Clone, PartialEq, Eq)]
pub struct CipherKeys {
    pub video: [u8; VIDEO_KEY_SIZE],
    pub audio: [u8; AUDIO_KEY_SIZE],
}

impl std::fmt::Debug for CipherKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherKeys").finish_non_exhaustive()
    }
}

/// Parse a key seed given as hex, with or without a `0x` prefix
pub fn parse_key(text: &str) -> Result<u64> {
    let trimmed = text.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if digits.is_empty() || digits.len() > 16 {
        return Err(UsmError::InvalidKeyFormat(text.to_string()));
    }

    let padded = format!("{digits:0>16}");
    let mut bytes = [0u8; 8];
    hex::decode_to_slice(&padded, &mut bytes)
        .map_err(|_| UsmError::InvalidKeyFormat(text.to_string()))?;
    Ok(u64::from_be_bytes(bytes))
}

/// Expand a seed into the video and audio keys
pub fn derive_keys(seed: u64) -> CipherKeys {
    let c = seed.to_le_bytes();
    let mut k = [0u8; 0x20];

    k[0x00] = c[0];
    k[0x01] = c[1];
    k[0x02] = c[2];
    k[0x03] = c[3].wrapping_sub(0x34);
    k[0x04] = c[4].wrapping_add(0xF9);
    k[0x05] = c[5] ^ 0x13;
    k[0x06] = c[6].wrapping_add(0x61);
    k[0x07] = k[0x00] ^ 0xFF;
    k[0x08] = k[0x01].wrapping_add(k[0x02]);
    k[0x09] = k[0x01].wrapping_sub(k[0x07]);
    k[0x0A] = k[0x02] ^ 0xFF;
    k[0x0B] = k[0x01] ^ 0xFF;
    k[0x0C] = k[0x0B].wrapping_add(k[0x09]);
    k[0x0D] = k[0x08].wrapping_sub(k[0x03]);
    k[0x0E] = k[0x0D] ^ 0xFF;
    k[0x0F] = k[0x0A].wrapping_sub(k[0x0B]);
    k[0x10] = k[0x08].wrapping_sub(k[0x0F]);
    k[0x11] = k[0x10] ^ k[0x07];
    k[0x12] = k[0x0F] ^ 0xFF;
    k[0x13] = k[0x03] ^ 0x10;
    k[0x14] = k[0x04].wrapping_sub(0x32);
    k[0x15] = k[0x05].wrapping_add(0xED);
    k[0x16] = k[0x06] ^ 0xF3;
    k[0x17] = k[0x13].wrapping_sub(k[0x0F]);
    k[0x18] = k[0x15].wrapping_add(k[0x07]);
    k[0x19] = 0x21u8.wrapping_sub(k[0x13]);
    k[0x1A] = k[0x14] ^ k[0x17];
    k[0x1B] = k[0x16].wrapping_add(k[0x16]);
    k[0x1C] = k[0x17].wrapping_add(0x44);
    k[0x1D] = k[0x03].wrapping_add(k[0x04]);
    k[0x1E] = k[0x05].wrapping_sub(k[0x16]);
    k[0x1F] = k[0x1D] ^ k[0x13];

    let mut video = [0u8; VIDEO_KEY_SIZE];
    let mut audio = [0u8; AUDIO_KEY_SIZE];
    for (i, &byte) in k.iter().enumerate() {
        video[i] = byte;
        video[0x20 + i] = byte ^ 0xFF;
        audio[i] = if i % 2 == 1 {
            AUDIO_TEMPLATE[(i >> 1) % 4]
        } else {
            byte ^ 0xFF
        };
    }

    CipherKeys { video, audio }
}
