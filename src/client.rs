//! Relay client: streams a WAV file through a running server and collects
//! the separated stems.

use crate::engine::EngineOptions;
use crate::error::{RelayError, Result};
use crate::server::protocol::{ClientMessage, ServerMessage};
use futures_util::{SinkExt, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

/// Interleaved audio decoded from a WAV file, scaled to [-1, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct WavAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl WavAudio {
    /// Decode integer (8–32 bit) or 32-bit float PCM from any reader.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let reader = hound::WavReader::new(reader)
            .map_err(|e| RelayError::malformed_audio(format!("Failed to parse WAV file: {}", e)))?;
        let spec = reader.spec();

        let samples = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .into_samples::<f32>()
                .collect::<std::result::Result<Vec<_>, _>>(),
            hound::SampleFormat::Int => {
                let scale = 1.0 / (1i64 << (spec.bits_per_sample - 1)) as f32;
                reader
                    .into_samples::<i32>()
                    .map(|s| s.map(|s| s as f32 * scale))
                    .collect::<std::result::Result<Vec<_>, _>>()
            }
        }
        .map_err(|e| RelayError::malformed_audio(format!("Failed to read WAV samples: {}", e)))?;

        Ok(Self {
            samples,
            sample_rate: spec.sample_rate,
            channels: spec.channels,
        })
    }

    pub fn open(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(std::io::BufReader::new(file))
    }

    pub fn frame_count(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    /// Split into chunks of whole frames, each paired with its start time
    /// in seconds.
    pub fn chunks(&self, chunk: Duration) -> impl Iterator<Item = (f64, &[f32])> + '_ {
        let channels = self.channels.max(1) as usize;
        let frames = ((self.sample_rate as f64 * chunk.as_secs_f64()).round() as usize).max(1);
        let sample_rate = self.sample_rate.max(1) as f64;
        self.samples
            .chunks(frames * channels)
            .enumerate()
            .map(move |(i, chunk)| ((i * frames) as f64 / sample_rate, chunk))
    }
}

/// Write a mono 32-bit float WAV file.
pub fn write_stem(path: &Path, samples: &[f32], sample_rate: u32) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let wav_error = |e: hound::Error| RelayError::Other(format!("Failed to write {}: {}", path.display(), e));

    let mut writer = hound::WavWriter::create(path, spec).map_err(wav_error)?;
    for &sample in samples {
        writer.write_sample(sample).map_err(wav_error)?;
    }
    writer.finalize().map_err(wav_error)
}

/// Options for one client run.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Server URL, e.g. `ws://127.0.0.1:8765`
    pub url: String,
    pub engine: EngineOptions,
    /// Audio duration per `audio_data` message
    pub chunk: Duration,
    /// Audio sent but not yet returned as stems before sending pauses.
    /// Keeps the server's window queue below its limit.
    pub max_in_flight: Duration,
    /// Stop waiting once all audio is sent and the server stays silent this long
    pub idle_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            url: format!("ws://{}:{}", crate::defaults::HOST, crate::defaults::PORT),
            engine: EngineOptions::default(),
            chunk: Duration::from_millis(250),
            max_in_flight: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(2),
        }
    }
}

/// Stems collected from the server.
#[derive(Debug, Clone, Default)]
pub struct SeparationOutput {
    /// Model reported by the server's status reply
    pub model: String,
    /// Mono samples per stem, each window placed at its position in the input
    pub stems: BTreeMap<String, Vec<f32>>,
    /// `error` messages received while streaming
    pub errors: Vec<String>,
    pub sample_rate: u32,
}

impl SeparationOutput {
    /// Write every stem to `<dir>/<stem>.wav`, creating `dir` if needed.
    pub fn write_to(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        std::fs::create_dir_all(dir)?;
        let mut written = Vec::with_capacity(self.stems.len());
        for (name, samples) in &self.stems {
            let path = dir.join(format!("{}.wav", file_stem(name)));
            write_stem(&path, samples, self.sample_rate)?;
            written.push(path);
        }
        Ok(written)
    }
}

/// Places `separated_audio` windows into per-stem buffers.
///
/// The server tags each window with the timestamp of the chunk that
/// completed it, and one chunk may complete several windows. Window `i`
/// covers frames `[i·W, (i+1)·W)`, so the first window completed by a chunk
/// starting at frame `s` is `s / W`; later windows for the same chunk follow
/// in the order they arrive.
#[derive(Debug, Default)]
struct StemAssembler {
    sample_rate: u32,
    stems: BTreeMap<String, Vec<f32>>,
    arrivals: HashMap<(String, u64), usize>,
    /// End of the furthest window received, in frames.
    returned_frames: usize,
}

impl StemAssembler {
    fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            ..Default::default()
        }
    }

    fn place(&mut self, stem: String, timestamp: f64, data: Vec<f32>) {
        let window = data.len();
        if window == 0 {
            return;
        }
        let start_frame = (timestamp.max(0.0) * self.sample_rate as f64).round() as u64;
        let arrival = self.arrivals.entry((stem.clone(), start_frame)).or_insert(0);
        let index = start_frame as usize / window + *arrival;
        *arrival += 1;

        let offset = index * window;
        let buffer = self.stems.entry(stem).or_default();
        if buffer.len() < offset + window {
            buffer.resize(offset + window, 0.0);
        }
        buffer[offset..offset + window].copy_from_slice(&data);
        self.returned_frames = self.returned_frames.max(offset + window);
    }
}

/// Stem names come from the server; keep them to safe file name characters.
fn file_stem(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "stem".to_string()
    } else {
        cleaned
    }
}

fn transport(e: impl std::fmt::Display) -> RelayError {
    RelayError::Transport {
        message: e.to_string(),
    }
}

fn encode(message: &ClientMessage) -> Result<Message> {
    message
        .to_json()
        .map(Message::text)
        .map_err(|e| RelayError::Other(format!("Failed to encode message: {}", e)))
}

/// Stream `audio` through the server at `options.url` and collect stems.
///
/// Sending pauses whenever more than `options.max_in_flight` of audio has
/// been sent without its stems coming back. If the server stays silent for
/// `idle_timeout` while audio is still pending, the limit is doubled, so a
/// server window longer than the limit cannot stall the stream.
///
/// Audio that does not fill a whole server window at the end of the file
/// is never processed, so stems may be slightly shorter than the input.
///
/// # Errors
/// Returns `Transport` on connection failure and `Other` if the server
/// rejects the `configure` request.
pub async fn separate(audio: &WavAudio, options: &ClientOptions) -> Result<SeparationOutput> {
    let (ws, _) = connect_async(options.url.as_str()).await.map_err(transport)?;
    let (mut write, mut read) = ws.split();

    write
        .send(encode(&ClientMessage::Configure {
            config: options.engine.clone(),
        })?)
        .await
        .map_err(transport)?;

    let model = loop {
        let frame = read
            .next()
            .await
            .ok_or_else(|| transport("connection closed before configure reply"))?
            .map_err(transport)?;
        let Message::Text(text) = frame else {
            continue;
        };
        match ServerMessage::from_json(text.as_str()) {
            Ok(ServerMessage::Status { model, stems, .. }) => {
                log::info!("Server configured '{}' (buses: {})", model, stems.join(", "));
                break model;
            }
            Ok(ServerMessage::Error { error }) => return Err(RelayError::Other(error)),
            Ok(other) => log::debug!("Ignoring {:?} before configure reply", other),
            Err(e) => log::warn!("Undecodable server message: {}", e),
        }
    };

    let channels = audio.channels.max(1) as usize;
    let total_frames = audio.frame_count();
    let mut budget =
        ((options.max_in_flight.as_secs_f64() * audio.sample_rate as f64).round() as usize).max(1);
    let mut chunks = audio.chunks(options.chunk);
    let mut sent_frames: usize = 0;
    let mut assembler = StemAssembler::new(audio.sample_rate);
    let mut errors = Vec::new();

    loop {
        while sent_frames.saturating_sub(assembler.returned_frames) < budget
            && let Some((timestamp, chunk)) = chunks.next()
        {
            let message = encode(&ClientMessage::AudioData {
                data: chunk.to_vec(),
                sample_rate: audio.sample_rate,
                channels: audio.channels,
                timestamp,
            })?;
            write.send(message).await.map_err(transport)?;
            sent_frames += chunk.len() / channels;
        }
        let all_sent = sent_frames >= total_frames;

        let frame = match tokio::time::timeout(options.idle_timeout, read.next()).await {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(e))) => return Err(transport(e)),
            Ok(None) => break,
            Err(_) if all_sent => break,
            Err(_) => {
                budget = budget.saturating_mul(2);
                log::debug!(
                    "No stems within {:?}, raising in-flight limit to {} frames",
                    options.idle_timeout,
                    budget
                );
                continue;
            }
        };
        let Message::Text(text) = frame else {
            continue;
        };
        match ServerMessage::from_json(text.as_str()) {
            Ok(ServerMessage::SeparatedAudio {
                stem,
                data,
                timestamp,
            }) => assembler.place(stem, timestamp, data),
            Ok(ServerMessage::Error { error }) => {
                log::warn!("Server error: {}", error);
                errors.push(error);
            }
            Ok(ServerMessage::Status { .. }) => {}
            Err(e) => log::warn!("Undecodable server message: {}", e),
        }
    }

    let _ = write.send(Message::Close(None)).await;

    Ok(SeparationOutput {
        model,
        stems: assembler.stems,
        errors,
        sample_rate: audio.sample_rate,
    })
}
