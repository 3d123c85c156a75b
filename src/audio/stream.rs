use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Stream, StreamConfig};
use log::{error, info, warn};
use rtrb::{Producer, RingBuffer};
use std::sync::Arc;

use super::click_track::ClickTrackBuffer;
use super::error::{MetronomeError, Result};
use super::output::{AudioOutput, LoopPlayer, PlayerMessage, SourceId};

/// Room for bursts of control messages between two device callbacks.
const COMMAND_QUEUE_CAPACITY: usize = 64;

/// Audio device output. The stream's callback owns a [`LoopPlayer`]; the
/// control side only talks to it through a lock-free ring buffer.
///
/// `cpal::Stream` is not `Send`, so this must be opened on the thread that
/// drives it.
pub struct DeviceOutput {
    _stream: Stream,
    commands: Producer<PlayerMessage>,
    sample_rate: u32,
    channels: u16,
    device_name: String,
    next_id: u64,
}

fn unavailable<E: std::fmt::Display>(e: E) -> MetronomeError {
    MetronomeError::AudioUnavailable(e.to_string())
}

fn find_device(device_name: Option<&str>) -> Result<Device> {
    let host = cpal::default_host();

    if let Some(name) = device_name {
        // Search devices by name
        for device in host.output_devices().map_err(unavailable)? {
            if let Ok(candidate) = device.name()
                && candidate == name
            {
                return Ok(device);
            }
        }
        return Err(MetronomeError::AudioUnavailable(format!(
            "output device '{}' not found",
            name
        )));
    }

    host.default_output_device()
        .ok_or_else(|| MetronomeError::AudioUnavailable("no output device available".to_string()))
}

impl DeviceOutput {
    pub fn open(device_name: Option<&str>) -> Result<Self> {
        let device = find_device(device_name)?;
        let default_config = device.default_output_config().map_err(unavailable)?;

        let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        let config = StreamConfig {
            channels: default_config.channels(),
            sample_rate: default_config.sample_rate(),
            buffer_size: cpal::BufferSize::Default,
        };
        let sample_rate = config.sample_rate.0;
        let channels = config.channels;

        info!(
            "Output device: {} ({}Hz, {}ch, {:?})",
            device_name,
            sample_rate,
            channels,
            default_config.sample_format()
        );

        let (producer, mut consumer) = RingBuffer::<PlayerMessage>::new(COMMAND_QUEUE_CAPACITY);
        let mut player = LoopPlayer::new();
        let output_channels = channels as usize;

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    while let Ok(message) = consumer.pop() {
                        player.apply(message);
                    }
                    player.fill(data, output_channels);
                },
                move |err| {
                    error!("Output stream error: {}", err);
                },
                None,
            )
            .map_err(unavailable)?;

        stream.play().map_err(unavailable)?;

        Ok(Self {
            _stream: stream,
            commands: producer,
            sample_rate,
            channels,
            device_name,
            next_id: 0,
        })
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    fn send(&mut self, message: PlayerMessage) -> Result<()> {
        self.commands.push(message).map_err(|_| {
            MetronomeError::AudioUnavailable("player command queue is full".to_string())
        })
    }
}

impl AudioOutput for DeviceOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn start_loop(&mut self, track: Arc<ClickTrackBuffer>) -> Result<SourceId> {
        self.next_id += 1;
        let id = SourceId(self.next_id);
        self.send(PlayerMessage::Play(id, track))?;
        Ok(id)
    }

    fn stop(&mut self, source: SourceId) {
        if let Err(e) = self.send(PlayerMessage::Stop(source)) {
            warn!("Could not stop source {:?}: {}", source, e);
        }
    }

    fn set_volume(&mut self, volume: f32) {
        if let Err(e) = self.send(PlayerMessage::Volume(volume)) {
            warn!("Could not set volume: {}", e);
        }
    }

    fn name(&self) -> &str {
        &self.device_name
    }
}

/// Names of every output device on the default host.
pub fn enumerate_output_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();
    let mut outputs = Vec::new();
    for device in host.output_devices().map_err(unavailable)? {
        outputs.push(device.name().unwrap_or_else(|_| "Unknown".to_string()));
    }
    Ok(outputs)
}
