use turntabler_audio::AudioFormat;

/// Reserved "length unknown" value for the RIFF and data size fields.
///
/// This sentinel is the load-bearing contract of the whole stream: it is
/// what lets the renderer treat the connection as a perpetual broadcast
/// instead of expecting EOF at a computed offset.
pub const UNBOUNDED_SIZE: u32 = 0xFFFF_FFFF;

/// A canonical PCM WAV header is exactly 44 bytes.
pub const WAV_HEADER_LEN: usize = 44;

const WAVE_FORMAT_PCM: u16 = 1;

/// Builds the fixed-size WAV descriptor sent once per connection, with the
/// unbounded sentinel in both size fields.
pub fn infinite_wav_header(format: AudioFormat) -> [u8; WAV_HEADER_LEN] {
    let mut header = [0u8; WAV_HEADER_LEN];
    let byte_rate = format.byte_rate() as u32;
    let block_align = format.frame_bytes() as u16;

    header[0..4].copy_from_slice(b"RIFF");
    header[4..8].copy_from_slice(&UNBOUNDED_SIZE.to_le_bytes());
    header[8..12].copy_from_slice(b"WAVE");

    header[12..16].copy_from_slice(b"fmt ");
    header[16..20].copy_from_slice(&16u32.to_le_bytes()); // fmt chunk size (PCM)
    header[20..22].copy_from_slice(&WAVE_FORMAT_PCM.to_le_bytes());
    header[22..24].copy_from_slice(&format.channels.to_le_bytes());
    header[24..28].copy_from_slice(&format.sample_rate.to_le_bytes());
    header[28..32].copy_from_slice(&byte_rate.to_le_bytes());
    header[32..34].copy_from_slice(&block_align.to_le_bytes());
    header[34..36].copy_from_slice(&format.bits_per_sample.to_le_bytes());

    header[36..40].copy_from_slice(b"data");
    header[40..44].copy_from_slice(&UNBOUNDED_SIZE.to_le_bytes());

    header
}
