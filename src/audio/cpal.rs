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
use std::{error::Error, fmt, thread, time::Duration};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tracing::{error, info, span, Level};

use crate::audio::thread_priority::{
    configure_thread_priority, output_thread_priority, rt_audio_enabled,
};
use crate::audio::{AudioMixer, Device as AudioDevice, OutputHandle};
use crate::config::{self, StreamBufferSize};
use crate::playsync::CancelHandle;

/// How often the output thread checks whether it should close the stream.
const CLOSE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A small wrapper around a cpal::Device.
pub struct Device {
    /// The name of the device.
    name: String,
    /// The maximum number of channels the device supports.
    max_channels: u16,
    /// The host ID of the device.
    host_id: cpal::HostId,
    /// The underlying cpal device.
    device: cpal::Device,
    /// Requested stream buffer size.
    stream_buffer_size: Option<StreamBufferSize>,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (Channels={}) ({})",
            self.name,
            self.max_channels,
            self.host_id.name()
        )
    }
}

impl Device {
    /// Lists cpal devices and produces the Device trait.
    pub fn list() -> Result<Vec<Box<dyn AudioDevice>>, Box<dyn Error>> {
        Ok(Device::list_cpal_devices()?
            .into_iter()
            .map(|device| {
                let device: Box<dyn AudioDevice> = Box::new(device);
                device
            })
            .collect())
    }

    /// Lists cpal output devices.
    fn list_cpal_devices() -> Result<Vec<Device>, Box<dyn Error>> {
        let mut devices: Vec<Device> = Vec::new();
        for host_id in cpal::available_hosts() {
            let host_devices = match cpal::host_from_id(host_id)?.output_devices() {
                Ok(host_devices) => host_devices,
                Err(e) => {
                    error!(
                        err = e.to_string(),
                        host = host_id.name(),
                        "Unable to list devices for host"
                    );
                    continue;
                }
            };

            for device in host_devices {
                let Ok(output_configs) = device.supported_output_configs() else {
                    continue;
                };
                let max_channels = output_configs
                    .map(|output_config| output_config.channels())
                    .max()
                    .unwrap_or(0);

                if max_channels > 0 {
                    devices.push(Device {
                        name: device.name()?,
                        max_channels,
                        host_id,
                        device,
                        stream_buffer_size: None,
                    })
                }
            }
        }

        devices.sort_by_key(|device| device.name.to_string());
        Ok(devices)
    }

    /// Gets the given cpal device. "default" selects the default host's default output.
    pub fn get(config: &config::Audio) -> Result<Device, Box<dyn Error>> {
        let name = config.device();
        if name == "default" {
            let host = cpal::default_host();
            let device = host
                .default_output_device()
                .ok_or("no default output device")?;
            let max_channels = device
                .supported_output_configs()?
                .map(|output_config| output_config.channels())
                .max()
                .unwrap_or(0);
            return Ok(Device {
                name: device.name()?,
                max_channels,
                host_id: host.id(),
                device,
                stream_buffer_size: config.stream_buffer_size(),
            });
        }

        match Device::list_cpal_devices()?
            .into_iter()
            .find(|device| device.name.trim() == name)
        {
            Some(mut device) => {
                device.stream_buffer_size = config.stream_buffer_size();
                Ok(device)
            }
            None => Err(format!("no device found with name {}", name).into()),
        }
    }

    fn buffer_size(&self) -> cpal::BufferSize {
        match &self.stream_buffer_size {
            None | Some(StreamBufferSize::Default) => cpal::BufferSize::Default,
            Some(StreamBufferSize::Fixed(frames)) => cpal::BufferSize::Fixed(*frames),
            Some(StreamBufferSize::Min) => match self.device.default_output_config() {
                Ok(supported) => match supported.buffer_size() {
                    cpal::SupportedBufferSize::Range { min, .. } => cpal::BufferSize::Fixed(*min),
                    cpal::SupportedBufferSize::Unknown => cpal::BufferSize::Default,
                },
                Err(_) => cpal::BufferSize::Default,
            },
        }
    }
}

/// Builds an output stream whose callback renders the mixer and converts to the device format.
fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mixer: AudioMixer,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: cpal::SizedSample + cpal::FromSample<f32>,
{
    let priority = output_thread_priority();
    let rt_audio = rt_audio_enabled();
    let mut priority_set = false;
    let mut scratch: Vec<f32> = Vec::new();
    let fault_mixer = mixer.clone();

    device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            configure_thread_priority("output", priority, rt_audio, &mut priority_set);
            if scratch.len() != data.len() {
                scratch.resize(data.len(), 0.0);
            }
            mixer.render(&mut scratch);
            for (dst, &src) in data.iter_mut().zip(scratch.iter()) {
                *dst = T::from_sample(src);
            }
        },
        move |err| fault_mixer.report_fault(format!("output stream error: {}", err)),
        None,
    )
}

impl AudioDevice for Device {
    fn open(&self, mixer: AudioMixer) -> Result<OutputHandle, Box<dyn Error>> {
        let span = span!(Level::INFO, "open output (cpal)");
        let _enter = span.enter();

        if self.max_channels < mixer.num_channels() {
            return Err(format!(
                "{} channels requested, audio device {} only has {}",
                mixer.num_channels(),
                self.name,
                self.max_channels
            )
            .into());
        }

        let sample_format = self.device.default_output_config()?.sample_format();
        let stream_config = cpal::StreamConfig {
            channels: mixer.num_channels(),
            sample_rate: cpal::SampleRate(mixer.sample_rate()),
            buffer_size: self.buffer_size(),
        };
        info!(
            device = self.name,
            channels = stream_config.channels,
            sample_rate = mixer.sample_rate(),
            format = ?sample_format,
            "Opening output."
        );

        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<(), String>>(1);
        let cancel_handle = CancelHandle::new();
        let join_handle = {
            let device = self.device.clone();
            let cancel_handle = cancel_handle.clone();
            // The stream is created and owned inside the thread; it is not Send on every host.
            thread::Builder::new()
                .name("cpal-output".to_string())
                .spawn(move || {
                    let stream_result = match sample_format {
                        cpal::SampleFormat::F32 => {
                            build_stream::<f32>(&device, &stream_config, mixer)
                        }
                        cpal::SampleFormat::I16 => {
                            build_stream::<i16>(&device, &stream_config, mixer)
                        }
                        cpal::SampleFormat::I32 => {
                            build_stream::<i32>(&device, &stream_config, mixer)
                        }
                        cpal::SampleFormat::U16 => {
                            build_stream::<u16>(&device, &stream_config, mixer)
                        }
                        other => {
                            let _ = ready_tx.send(Err(format!(
                                "unsupported output sample format {:?}",
                                other
                            )));
                            return;
                        }
                    };

                    let stream = match stream_result {
                        Ok(stream) => stream,
                        Err(e) => {
                            let _ = ready_tx.send(Err(format!("failed to create stream: {}", e)));
                            return;
                        }
                    };
                    if let Err(e) = stream.play() {
                        let _ = ready_tx.send(Err(format!("failed to start stream: {}", e)));
                        return;
                    }
                    let _ = ready_tx.send(Ok(()));

                    while !cancel_handle.wait_timeout(CLOSE_POLL_INTERVAL) {}
                    drop(stream);
                })?
        };

        match ready_rx.recv() {
            Ok(Ok(())) => {
                info!(device = self.name, "CPAL output stream started successfully");
                Ok(OutputHandle::new(cancel_handle, join_handle))
            }
            Ok(Err(e)) => {
                let _ = join_handle.join();
                Err(e.into())
            }
            Err(_) => {
                let _ = join_handle.join();
                Err("output thread exited before the stream started".into())
            }
        }
    }
}
