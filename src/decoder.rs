//! Beacon advertisement frame decoding
use thiserror::Error;

use crate::models::DecodedSample;

/// Minimum number of byte tokens a frame must carry.
pub const FRAME_LEN: usize = 26;
/// Number of secondary channel values per frame.
pub const SECONDARY_CHANNELS: usize = 10;

// Conversion constants fixed by the beacon firmware.
const MOTION_SCALE: f64 = 0.015625; // 8-bit value onto a -2g..+2g range
const MOTION_OFFSET: f64 = 2.0;
const CHANNEL_SCALE: f64 = 0.0000254312;
const CHANNEL_OFFSET: f64 = 0.33333;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("truncated frame: expected at least 26 byte tokens, got {got}")]
    Truncated { got: usize },
    #[error("not a hex byte token: {0:?}")]
    NotHex(String),
}

fn motion_channel(byte: u8) -> f64 {
    byte as f64 * MOTION_SCALE - MOTION_OFFSET
}

fn wide_channel(raw: u16) -> f64 {
    raw as f64 * CHANNEL_SCALE - CHANNEL_OFFSET
}

/// Decode a raw advertisement frame into physical readings.
///
/// The beacon frame is a sequence of byte tokens with the following layout:
/// - Token 0: header byte, carries no physical value
/// - Tokens 1-3: motion X/Y/Z, each `byte * 0.015625 - 2.0`
/// - Tokens 4-5: big-endian u16, `value * 0.0000254312 - 0.33333` (primary)
/// - Tokens 6-25: ten big-endian u16 pairs, same conversion, in frame order
///
/// Out-of-range readings are passed through unchanged; the beacon is trusted
/// to emit consistent ranges.
///
/// # Arguments
/// * `frame` - Raw manufacturer data bytes from a BLE advertisement
///
/// # Returns
/// The decoded sample, or `DecodeError::Truncated` for frames shorter than
/// 26 bytes. Short frames never produce a partial sample.
pub fn decode(frame: &[u8]) -> Result<DecodedSample, DecodeError> {
    if frame.len() < FRAME_LEN {
        return Err(DecodeError::Truncated { got: frame.len() });
    }

    let motion_x = motion_channel(frame[1]);
    let motion_y = motion_channel(frame[2]);
    let motion_z = motion_channel(frame[3]);

    let primary = wide_channel(u16::from_be_bytes([frame[4], frame[5]]));

    let mut secondary = [0.0; SECONDARY_CHANNELS];
    for (slot, pair) in secondary
        .iter_mut()
        .zip(frame[6..FRAME_LEN].chunks_exact(2))
    {
        *slot = wide_channel(u16::from_be_bytes([pair[0], pair[1]]));
    }

    Ok(DecodedSample {
        // Not carried in this frame layout.
        battery: None,
        motion_x,
        motion_y,
        motion_z,
        primary,
        secondary,
    })
}

/// Decode a frame given as hex text, two characters per byte token.
///
/// Whitespace and `:` separators between tokens are cosmetic and are
/// stripped before tokenization. Fails with `DecodeError::NotHex` on any
/// token that is not two hexadecimal characters.
pub fn decode_hex(text: &str) -> Result<DecodedSample, DecodeError> {
    decode(&parse_hex_tokens(text)?)
}

fn parse_hex_tokens(text: &str) -> Result<Vec<u8>, DecodeError> {
    let compact: Vec<char> = text
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();

    let mut bytes = Vec::with_capacity(compact.len() / 2);
    for pair in compact.chunks(2) {
        let token: String = pair.iter().collect();
        if pair.len() != 2 || !pair.iter().all(|c| c.is_ascii_hexdigit()) {
            return Err(DecodeError::NotHex(token));
        }
        bytes.push(u8::from_str_radix(&token, 16).unwrap_or(0));
    }
    Ok(bytes)
}
