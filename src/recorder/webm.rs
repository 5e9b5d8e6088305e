// Copyright (C) 2025 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Opus in WebM.
//!
//! Captured audio is encoded into 20 ms Opus packets and muxed into a single-track WebM file:
//! the EBML header, then one segment holding the info, the track entry and a cluster per second
//! of audio. Every packet is a keyframe, so each goes into its own SimpleBlock.

use opus::{Application, Channels, Encoder};

use super::RecorderError;
use crate::samples::transcode_samples;

/// Rates Opus encodes natively. Anything else is resampled to 48 kHz.
const OPUS_RATES: [u32; 5] = [8000, 12000, 16000, 24000, 48000];
/// Pre-skip and codec delay are always expressed at this rate.
const OPUS_REFERENCE_RATE: u32 = 48000;
const PACKET_MS: u64 = 20;
const PACKETS_PER_CLUSTER: usize = 50;
const MAX_PACKET_BYTES: usize = 4000;
const SEEK_PRE_ROLL_NS: u64 = 80_000_000;
const TRACK_NUMBER: u8 = 1;
const MUXING_APP: &str = "beatpad";

const EBML: u32 = 0x1A45_DFA3;
const EBML_VERSION: u32 = 0x4286;
const EBML_READ_VERSION: u32 = 0x42F7;
const EBML_MAX_ID_LENGTH: u32 = 0x42F2;
const EBML_MAX_SIZE_LENGTH: u32 = 0x42F3;
const DOC_TYPE: u32 = 0x4282;
const DOC_TYPE_VERSION: u32 = 0x4287;
const DOC_TYPE_READ_VERSION: u32 = 0x4285;
const SEGMENT: u32 = 0x1853_8067;
const INFO: u32 = 0x1549_A966;
const TIMESTAMP_SCALE: u32 = 0x2A_D7B1;
const MUXING_APP_ID: u32 = 0x4D80;
const WRITING_APP_ID: u32 = 0x5741;
const DURATION: u32 = 0x4489;
const TRACKS: u32 = 0x1654_AE6B;
const TRACK_ENTRY: u32 = 0xAE;
const TRACK_NUMBER_ID: u32 = 0xD7;
const TRACK_UID: u32 = 0x73C5;
const TRACK_TYPE: u32 = 0x83;
const CODEC_ID: u32 = 0x86;
const CODEC_PRIVATE: u32 = 0x63A2;
const CODEC_DELAY: u32 = 0x56AA;
const SEEK_PRE_ROLL: u32 = 0x56BB;
const AUDIO: u32 = 0xE1;
const SAMPLING_FREQUENCY: u32 = 0xB5;
const CHANNELS: u32 = 0x9F;
const CLUSTER: u32 = 0x1F43_B675;
const TIMESTAMP: u32 = 0xE7;
const SIMPLE_BLOCK: u32 = 0xA3;

const TRACK_TYPE_AUDIO: u64 = 2;
const KEYFRAME: u8 = 0x80;

fn encode_error(e: opus::Error) -> RecorderError {
    RecorderError::Encode(e.to_string())
}

/// Encodes interleaved samples as an Opus-in-WebM file. Channels past the second are dropped.
pub(super) fn encode(
    samples: &[f32],
    channels: u16,
    sample_rate: u32,
) -> Result<Vec<u8>, RecorderError> {
    let source_channels = channels.max(1) as usize;
    let out_channels = source_channels.min(2);
    let mut pcm: Vec<f32> = if source_channels == out_channels {
        samples.to_vec()
    } else {
        samples
            .chunks_exact(source_channels)
            .flat_map(|frame| frame[..out_channels].iter().copied())
            .collect()
    };
    let duration_ms = (pcm.len() / out_channels) as f64 * 1000.0 / sample_rate.max(1) as f64;

    let rate = if OPUS_RATES.contains(&sample_rate) {
        sample_rate
    } else {
        pcm = transcode_samples(&pcm, out_channels as u16, sample_rate, OPUS_REFERENCE_RATE);
        OPUS_REFERENCE_RATE
    };

    let opus_channels = if out_channels == 1 {
        Channels::Mono
    } else {
        Channels::Stereo
    };
    let mut encoder =
        Encoder::new(rate, opus_channels, Application::Audio).map_err(encode_error)?;
    let lookahead = encoder.get_lookahead().map_err(encode_error)?.max(0) as usize;

    // Flush the encoder's lookahead so the tail survives pre-skip.
    pcm.resize(pcm.len() + lookahead * out_channels, 0.0);

    let frame_len = (rate as u64 * PACKET_MS / 1000) as usize * out_channels;
    let mut frame = vec![0.0f32; frame_len];
    let mut buffer = vec![0u8; MAX_PACKET_BYTES];
    let mut packets = Vec::with_capacity(pcm.len() / frame_len + 1);
    for chunk in pcm.chunks(frame_len) {
        frame[..chunk.len()].copy_from_slice(chunk);
        frame[chunk.len()..].fill(0.0);
        let len = encoder
            .encode_float(&frame, &mut buffer)
            .map_err(encode_error)?;
        packets.push(buffer[..len].to_vec());
    }

    let pre_skip = (lookahead as u64 * OPUS_REFERENCE_RATE as u64 / rate as u64) as u16;
    Ok(mux(
        &packets,
        out_channels as u8,
        pre_skip,
        sample_rate,
        duration_ms,
    ))
}

/// The Opus identification header carried as the track's codec private data.
fn opus_head(channels: u8, pre_skip: u16, input_rate: u32) -> Vec<u8> {
    let mut head = Vec::with_capacity(19);
    head.extend_from_slice(b"OpusHead");
    head.push(1);
    head.push(channels);
    head.extend_from_slice(&pre_skip.to_le_bytes());
    head.extend_from_slice(&input_rate.to_le_bytes());
    head.extend_from_slice(&0i16.to_le_bytes());
    head.push(0);
    head
}

fn mux(packets: &[Vec<u8>], channels: u8, pre_skip: u16, input_rate: u32, duration_ms: f64) -> Vec<u8> {
    let mut out = Vec::new();
    master(&mut out, EBML, |header| {
        uint(header, EBML_VERSION, 1);
        uint(header, EBML_READ_VERSION, 1);
        uint(header, EBML_MAX_ID_LENGTH, 4);
        uint(header, EBML_MAX_SIZE_LENGTH, 8);
        string(header, DOC_TYPE, "webm");
        uint(header, DOC_TYPE_VERSION, 4);
        uint(header, DOC_TYPE_READ_VERSION, 2);
    });

    master(&mut out, SEGMENT, |segment| {
        master(segment, INFO, |info| {
            // Timestamps are in milliseconds.
            uint(info, TIMESTAMP_SCALE, 1_000_000);
            string(info, MUXING_APP_ID, MUXING_APP);
            string(info, WRITING_APP_ID, MUXING_APP);
            float(info, DURATION, duration_ms);
        });

        master(segment, TRACKS, |tracks| {
            master(tracks, TRACK_ENTRY, |entry| {
                uint(entry, TRACK_NUMBER_ID, TRACK_NUMBER as u64);
                uint(entry, TRACK_UID, 1);
                uint(entry, TRACK_TYPE, TRACK_TYPE_AUDIO);
                string(entry, CODEC_ID, "A_OPUS");
                element(entry, CODEC_PRIVATE, &opus_head(channels, pre_skip, input_rate));
                uint(
                    entry,
                    CODEC_DELAY,
                    pre_skip as u64 * 1_000_000_000 / OPUS_REFERENCE_RATE as u64,
                );
                uint(entry, SEEK_PRE_ROLL, SEEK_PRE_ROLL_NS);
                master(entry, AUDIO, |audio| {
                    float(audio, SAMPLING_FREQUENCY, OPUS_REFERENCE_RATE as f64);
                    uint(audio, CHANNELS, channels as u64);
                });
            });
        });

        for (index, cluster_packets) in packets.chunks(PACKETS_PER_CLUSTER).enumerate() {
            master(segment, CLUSTER, |cluster| {
                uint(
                    cluster,
                    TIMESTAMP,
                    (index * PACKETS_PER_CLUSTER) as u64 * PACKET_MS,
                );
                for (offset, packet) in cluster_packets.iter().enumerate() {
                    let relative = (offset as u64 * PACKET_MS) as i16;
                    let mut block = Vec::with_capacity(packet.len() + 4);
                    block.push(0x80 | TRACK_NUMBER);
                    block.extend_from_slice(&relative.to_be_bytes());
                    block.push(KEYFRAME);
                    block.extend_from_slice(packet);
                    element(cluster, SIMPLE_BLOCK, &block);
                }
            });
        }
    });
    out
}

/// Writes an element id. Ids carry their own length marker.
fn put_id(out: &mut Vec<u8>, id: u32) {
    let bytes = id.to_be_bytes();
    let skip = bytes.iter().position(|b| *b != 0).unwrap_or(3);
    out.extend_from_slice(&bytes[skip..]);
}

/// Writes a size as the shortest variable-length integer that holds it.
fn put_size(out: &mut Vec<u8>, size: u64) {
    let mut len = 1;
    // All ones is reserved for unknown sizes.
    while len < 8 && size >= (1u64 << (7 * len)) - 1 {
        len += 1;
    }
    let marked = size | (1u64 << (7 * len));
    out.extend_from_slice(&marked.to_be_bytes()[8 - len..]);
}

fn element(out: &mut Vec<u8>, id: u32, payload: &[u8]) {
    put_id(out, id);
    put_size(out, payload.len() as u64);
    out.extend_from_slice(payload);
}

fn master<F: FnOnce(&mut Vec<u8>)>(out: &mut Vec<u8>, id: u32, build: F) {
    let mut body = Vec::new();
    build(&mut body);
    element(out, id, &body);
}

fn uint(out: &mut Vec<u8>, id: u32, value: u64) {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().position(|b| *b != 0).unwrap_or(7);
    element(out, id, &bytes[skip..]);
}

fn float(out: &mut Vec<u8>, id: u32, value: f64) {
    element(out, id, &value.to_be_bytes());
}

fn string(out: &mut Vec<u8>, id: u32, value: &str) {
    element(out, id, value.as_bytes());
}
