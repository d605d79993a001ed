use crate::pipeline::keys::{AUDIO_KEY_SIZE, VIDEO_KEY_SIZE};

/// Video payloads shorter than this are stored in the clear
pub const VIDEO_CIPHER_MIN_LEN: usize = 0x240;

/// Audio bytes before this offset are stored in the clear
pub const AUDIO_CIPHER_START: usize = 0x140;

/// Start of the first video pass
const VIDEO_HEAD: usize = 0x40;

/// Length of the first video pass
const VIDEO_HEAD_LEN: usize = 0x100;

/// The first pass mixes in plaintext read from here on
const VIDEO_MIX_SOURCE: usize = 0x140;

/// Encrypt a video payload in place.
///
/// Two passes: 0x40..0x140 is XORed against a state folded from the
/// plaintext at 0x140..0x240, then the tail from 0x140 is XORed against a
/// rolling state chained through the plaintext.
pub fn encrypt_video(data: &mut [u8], key: &[u8; VIDEO_KEY_SIZE]) {
    if data.len() < VIDEO_CIPHER_MIN_LEN {
        return;
    }
    let mut rolling = *key;
    head_pass(data, &mut rolling);

    for i in VIDEO_HEAD_LEN..data.len() - VIDEO_HEAD {
        let pos = VIDEO_HEAD + i;
        let k = 0x20 + i % 0x20;
        let plain = data[pos];
        data[pos] ^= rolling[k];
        rolling[k] = plain ^ key[k];
    }
}

/// Inverse of [`encrypt_video`]: the tail is recovered first so the head
/// pass sees plaintext again.
pub fn decrypt_video(data: &mut [u8], key: &[u8; VIDEO_KEY_SIZE]) {
    if data.len() < VIDEO_CIPHER_MIN_LEN {
        return;
    }
    let mut rolling = *key;

    for i in VIDEO_HEAD_LEN..data.len() - VIDEO_HEAD {
        let pos = VIDEO_HEAD + i;
        let k = 0x20 + i % 0x20;
        data[pos] ^= rolling[k];
        rolling[k] = data[pos] ^ key[k];
    }

    head_pass(data, &mut rolling);
}

/// XOR 0x40..0x140 against the low half of `rolling`, folding in the
/// plaintext at 0x140..0x240 as it goes. Self-inverse given plaintext there.
fn head_pass(data: &mut [u8], rolling: &mut [u8; VIDEO_KEY_SIZE]) {
    for i in 0..VIDEO_HEAD_LEN {
        let k = i % 0x20;
        rolling[k] ^= data[VIDEO_MIX_SOURCE + i];
        data[VIDEO_HEAD + i] ^= rolling[k];
    }
}

/// Encrypt an audio payload in place
pub fn encrypt_audio(data: &mut [u8], key: &[u8; AUDIO_KEY_SIZE]) {
    xor_audio(data, key);
}

/// Decrypt an audio payload in place (the transform is its own inverse)
pub fn decrypt_audio(data: &mut [u8], key: &[u8; AUDIO_KEY_SIZE]) {
    xor_audio(data, key);
}

fn xor_audio(data: &mut [u8], key: &[u8; AUDIO_KEY_SIZE]) {
    if data.len() <= AUDIO_CIPHER_START {
        return;
    }
    for (i, byte) in data.iter_mut().enumerate().skip(AUDIO_CIPHER_START) {
        *byte ^= key[i % AUDIO_KEY_SIZE];
    }
}
