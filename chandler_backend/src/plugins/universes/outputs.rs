use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use thread_priority::{set_current_thread_priority, ThreadPriority};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum OutputError {
	#[error("Output has been closed")]
	Closed,
	#[error("Output device error: {0}")]
	Device(String),
}

/// One rendered frame, plus timing hints for devices that fade on their own
pub struct OutputFrame<'a> {
	pub values: &'a [f32],
	/// Absolute time the current fade should finish
	pub fade_end_time: f64,
	/// Onboard interpolation requested by effect layers, seconds
	pub interpolation_time: f64,
}

/// Physical or virtual transmission backend of a universe.
pub trait UniverseOutput: Send {
	fn on_frame(&mut self, frame: &OutputFrame) -> Result<(), OutputError>;

	fn close(&mut self) {}
}

/// Discards every frame
pub struct NullOutput;

impl UniverseOutput for NullOutput {
	fn on_frame(&mut self, _frame: &OutputFrame) -> Result<(), OutputError> {
		return Ok(());
	}
}

#[derive(Debug, Default)]
struct CaptureState {
	last: Vec<f32>,
	frames: u64,
}

/// Keeps the most recent frame in shared memory, for monitoring and tests.
#[derive(Clone, Default)]
pub struct CaptureOutput(Arc<Mutex<CaptureState>>);

impl CaptureOutput {
	pub fn new() -> Self {
		return CaptureOutput::default();
	}

	pub fn last_frame(&self) -> Vec<f32> {
		return self.0.lock().last.clone();
	}

	pub fn frame_count(&self) -> u64 {
		return self.0.lock().frames;
	}
}

impl UniverseOutput for CaptureOutput {
	fn on_frame(&mut self, frame: &OutputFrame) -> Result<(), OutputError> {
		let mut state = self.0.lock();
		state.last.clear();
		state.last.extend_from_slice(frame.values);
		state.frames += 1;
		return Ok(());
	}
}

/// Encodes channels `1..` of `values` (slot 0 is never transmitted) as DMX
/// levels.
pub fn dmx_levels(values: &[f32]) -> [u8; 512] {
	let mut levels = [0u8; 512];
	for (level, value) in levels.iter_mut().zip(values.iter().skip(1)) {
		*level = value.clamp(0.0, 255.0) as u8;
	}
	return levels;
}

/// Wraps `levels` in an Enttec DMX USB Pro "send DMX" packet.
pub fn encode_pro_packet(levels: &[u8]) -> Vec<u8> {
	// Payload length includes the DMX start code
	let len = levels.len() + 1;
	let mut out = Vec::with_capacity(len + 5);
	out.extend_from_slice(&[0x7E, 0x06, (len & 0xFF) as u8, (len >> 8) as u8, 0x00]);
	out.extend_from_slice(levels);
	out.push(0xE7);
	return out;
}

/// A connected DMX interface. Lives on the output thread.
pub trait DmxDevice {
	fn send(&mut self, levels: &[u8; 512]) -> Result<(), OutputError>;

	fn close(&mut self) {}
}

/// Opens the device, again after every failure.
pub type DmxConnector = Box<dyn Fn() -> Result<Box<dyn DmxDevice>, OutputError> + Send>;

/// Enttec DMX USB Pro. The widget generates the DMX signal itself, so the
/// virtual serial port only carries framed packets.
pub struct EnttecProDevice(File);

impl EnttecProDevice {
	pub fn connector(port: PathBuf) -> DmxConnector {
		return Box::new(move || {
			let file = OpenOptions::new()
				.write(true)
				.open(&port)
				.map_err(|err| OutputError::Device(format!("{}: {err}", port.display())))?;
			return Ok(Box::new(EnttecProDevice(file)) as Box<dyn DmxDevice>);
		});
	}
}

impl DmxDevice for EnttecProDevice {
	fn send(&mut self, levels: &[u8; 512]) -> Result<(), OutputError> {
		let packet = encode_pro_packet(levels);
		return self
			.0
			.write_all(&packet)
			.and_then(|_| self.0.flush())
			.map_err(|err| OutputError::Device(err.to_string()));
	}
}

/// Enttec Open DMX USB through the FTDI D2XX driver, which produces the
/// break and 250 kbaud line timing the interface needs.
#[cfg(feature = "output-dmx-enttecopendmx")]
pub struct EnttecOpenDevice(enttecopendmx::EnttecOpenDMX);

#[cfg(feature = "output-dmx-enttecopendmx")]
impl EnttecOpenDevice {
	pub fn connector() -> DmxConnector {
		return Box::new(|| {
			let mut port = enttecopendmx::EnttecOpenDMX::new().map_err(|err| OutputError::Device(format!("{err:?}")))?;
			port.open().map_err(|err| OutputError::Device(format!("{err:?}")))?;
			return Ok(Box::new(EnttecOpenDevice(port)) as Box<dyn DmxDevice>);
		});
	}
}

#[cfg(feature = "output-dmx-enttecopendmx")]
impl DmxDevice for EnttecOpenDevice {
	fn send(&mut self, levels: &[u8; 512]) -> Result<(), OutputError> {
		for (i, level) in levels.iter().enumerate() {
			self.0.set_channel(i + 1, *level);
		}
		return self.0.render().map_err(|err| OutputError::Device(format!("{err:?}")));
	}

	fn close(&mut self) {
		self.0.close().ok();
	}
}

type Mailbox = Arc<Mutex<Option<[u8; 512]>>>;

/// Streams frames to a DMX interface from a dedicated thread.
///
/// Frames are handed over through a single-slot mailbox, so a slow device
/// only ever sees the latest frame. The last frame is repeated every
/// interval, and the device is reopened every two seconds while it is
/// unavailable.
pub struct DmxThreadOutput {
	shutdown_trigger: Arc<AtomicBool>,
	mailbox: Mailbox,
	thread_handle: Option<std::thread::JoinHandle<()>>,
}

impl DmxThreadOutput {
	pub fn new(name: &str, connect: DmxConnector, framerate: f64) -> Result<Self, OutputError> {
		let shutdown_trigger = Arc::new(AtomicBool::new(false));
		let mailbox: Mailbox = Arc::new(Mutex::new(None));
		let thread_shutdown_trigger = Arc::clone(&shutdown_trigger);
		let thread_mailbox = Arc::clone(&mailbox);
		let interval = Duration::from_secs_f64(1.0 / framerate.clamp(1.0, 1000.0));
		let label = String::from(name);
		let thread_handle = std::thread::Builder::new()
			.name(format!("dmx-{name}"))
			.spawn(move || thread_loop(label, connect, interval, thread_shutdown_trigger, thread_mailbox))
			.map_err(|err| OutputError::Device(err.to_string()))?;
		return Ok(DmxThreadOutput {
			shutdown_trigger,
			mailbox,
			thread_handle: Some(thread_handle),
		});
	}
}

impl UniverseOutput for DmxThreadOutput {
	fn on_frame(&mut self, frame: &OutputFrame) -> Result<(), OutputError> {
		if self.shutdown_trigger.load(Ordering::Relaxed) {
			return Err(OutputError::Closed);
		}
		*self.mailbox.lock() = Some(dmx_levels(frame.values));
		return Ok(());
	}

	fn close(&mut self) {
		self.shutdown_trigger.store(true, Ordering::Relaxed);
		if let Some(handle) = self.thread_handle.take() {
			if handle.join().is_err() {
				warn!("DMX output thread panicked");
			}
		}
	}
}

impl Drop for DmxThreadOutput {
	fn drop(&mut self) {
		if !self.shutdown_trigger.load(Ordering::Relaxed) {
			debug!("DmxThreadOutput dropped without close()");
			self.shutdown_trigger.store(true, Ordering::Relaxed);
		}
	}
}

fn thread_loop(name: String, connect: DmxConnector, interval: Duration, shutdown_trigger: Arc<AtomicBool>, mailbox: Mailbox) {
	set_current_thread_priority(ThreadPriority::Max).ok();
	let mut last_retry = Instant::now();
	let mut device = connect();
	let mut levels: Option<[u8; 512]> = None;

	loop {
		if shutdown_trigger.load(Ordering::Relaxed) {
			break;
		}

		match device {
			Ok(ref mut inner) => {
				if let Some(next) = mailbox.lock().take() {
					levels = Some(next);
				}
				if let Some(levels) = &levels {
					if let Err(err) = inner.send(levels) {
						warn!(output = %name, error = %err, "DMX write failed");
						inner.close();
						device = Err(err);
						continue;
					}
				}
				std::thread::sleep(interval);
			}
			Err(_) => {
				// Keep sleeps short so shutdown stays responsive
				while last_retry.elapsed() < Duration::from_secs(2) {
					std::thread::sleep(Duration::from_millis(10));
					if shutdown_trigger.load(Ordering::Relaxed) {
						return;
					}
				}
				last_retry = Instant::now();
				device = connect();
				if device.is_ok() {
					info!(output = %name, "DMX interface connected");
				}
			}
		}
	}
	if let Ok(mut inner) = device {
		inner.close();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn frame(values: &[f32]) -> OutputFrame<'_> {
		return OutputFrame {
			values,
			fade_end_time: 0.0,
			interpolation_time: 0.0,
		};
	}

	#[test]
	fn levels_skip_slot_zero_and_clamp() {
		let levels = dmx_levels(&[99.0, 300.0, 12.7, -4.0]);
		assert_eq!(&levels[..4], &[255, 12, 0, 0]);
	}

	#[test]
	fn pro_framing() {
		let packet = encode_pro_packet(&[255, 12, 0]);
		assert_eq!(packet, vec![0x7E, 0x06, 4, 0, 0x00, 255, 12, 0, 0xE7]);
	}

	#[test]
	fn capture_keeps_last_frame() {
		let mut capture = CaptureOutput::new();
		let handle = capture.clone();
		capture.on_frame(&frame(&[1.0, 2.0])).unwrap();
		assert_eq!(handle.last_frame(), vec![1.0, 2.0]);
		assert_eq!(handle.frame_count(), 1);
	}

	struct Recorder(Arc<Mutex<Vec<[u8; 512]>>>);

	impl DmxDevice for Recorder {
		fn send(&mut self, levels: &[u8; 512]) -> Result<(), OutputError> {
			self.0.lock().push(*levels);
			return Ok(());
		}
	}

	#[test]
	fn thread_output_streams_latest_frame() {
		let sent = Arc::new(Mutex::new(Vec::new()));
		let device_sent = Arc::clone(&sent);
		let connect: DmxConnector =
			Box::new(move || Ok(Box::new(Recorder(Arc::clone(&device_sent))) as Box<dyn DmxDevice>));
		let mut output = DmxThreadOutput::new("test", connect, 200.0).unwrap();
		output.on_frame(&frame(&[0.0, 10.0, 20.0])).unwrap();

		let deadline = Instant::now() + Duration::from_secs(2);
		while sent.lock().is_empty() && Instant::now() < deadline {
			std::thread::sleep(Duration::from_millis(5));
		}
		output.close();
		let sent = sent.lock();
		assert!(!sent.is_empty());
		assert_eq!(&sent[0][..2], &[10, 20]);
	}

	#[test]
	fn thread_output_survives_missing_device() {
		let dir = tempfile::tempdir().unwrap();
		let connect = EnttecProDevice::connector(dir.path().join("missing").join("tty"));
		let mut output = DmxThreadOutput::new("missing", connect, 44.0).unwrap();
		output.on_frame(&frame(&[0.0, 10.0])).unwrap();
		output.close();
		assert!(output.on_frame(&frame(&[0.0])).is_err());
	}
}
