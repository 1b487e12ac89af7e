//! Structured event bus for scheduler lifecycle events, grounded on
//! `versatiles_container/src/runtime/events.rs`. The teacher uses
//! `arc-swap` for lock-free hot path emission; this crate swaps that for
//! `parking_lot::RwLock`, already a dependency for actor-local locking
//! elsewhere, rather than pull in a crate used in exactly one place (see
//! DESIGN.md).

use std::sync::Arc;

use parking_lot::RwLock;

use crate::types::{ArrayId, QueryId, RasterId, TileId, TileState};

/// Events emitted by the scheduler as queries and tiles move through their
/// lifecycles, plus plain log forwarding.
#[derive(Debug, Clone)]
pub enum Event {
	Log { level: LogLevel, target: String, message: String },
	TileStateChanged { tile: TileId, to: TileState },
	QueryPosted { query: QueryId, raster: RasterId },
	QueryDelivered { query: QueryId, array: ArrayId },
	QueryDone { query: QueryId },
	QueryCancelled { query: QueryId },
	RasterClosed { raster: RasterId },
	Warning { message: String },
	Error { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
	Error,
	Warn,
	Info,
	Debug,
	Trace,
}

type EventListener = Arc<dyn Fn(&Event) + Send + Sync>;

/// Thread-safe event bus. Listener calls are synchronous; a panicking
/// listener is caught so it cannot take down the scheduler thread, mirroring
/// `versatiles_container::runtime::events::EventBus::emit`.
#[derive(Clone, Default)]
pub struct EventBus {
	listeners: Arc<RwLock<Vec<EventListener>>>,
}

impl EventBus {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	pub fn subscribe<F>(&self, listener: F)
	where
		F: Fn(&Event) + Send + Sync + 'static,
	{
		self.listeners.write().push(Arc::new(listener));
	}

	pub fn emit(&self, event: Event) {
		let listeners = self.listeners.read();
		for listener in listeners.iter() {
			let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| listener(&event)));
		}
	}

	pub fn log(&self, level: LogLevel, target: &str, message: impl Into<String>) {
		self.emit(Event::Log {
			level,
			target: target.to_string(),
			message: message.into(),
		});
	}

	pub fn tile_state_changed(&self, tile: TileId, to: TileState) {
		self.emit(Event::TileStateChanged { tile, to });
	}

	pub fn warn(&self, message: impl Into<String>) {
		self.emit(Event::Warning { message: message.into() });
	}

	pub fn error(&self, message: impl Into<String>) {
		self.emit(Event::Error { message: message.into() });
	}

	/// Install this bus as the process-wide `log` facade, so `log::{debug,warn,error}!`
	/// calls anywhere in the crate (and any dependency using `log`) surface as
	/// `Event::Log` through the same bus as the scheduler's own structured events.
	/// Call at most once per process; a second call returns the `SetLoggerError`
	/// untouched rather than panicking.
	pub fn install_as_logger(self) -> Result<(), log::SetLoggerError> {
		log::set_max_level(log::LevelFilter::Trace);
		log::set_boxed_logger(Box::new(self))
	}
}

fn log_level(level: log::Level) -> LogLevel {
	match level {
		log::Level::Error => LogLevel::Error,
		log::Level::Warn => LogLevel::Warn,
		log::Level::Info => LogLevel::Info,
		log::Level::Debug => LogLevel::Debug,
		log::Level::Trace => LogLevel::Trace,
	}
}

impl log::Log for EventBus {
	fn enabled(&self, _metadata: &log::Metadata) -> bool {
		true
	}

	fn log(&self, record: &log::Record) {
		self.emit(Event::Log {
			level: log_level(record.level()),
			target: record.target().to_string(),
			message: record.args().to_string(),
		});
	}

	fn flush(&self) {}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::TileIndex;
	use std::sync::Mutex;

	#[test]
	fn subscribers_receive_emitted_events() {
		let bus = EventBus::new();
		let seen = Arc::new(Mutex::new(Vec::new()));
		let seen2 = seen.clone();
		bus.subscribe(move |e| seen2.lock().unwrap().push(format!("{e:?}")));

		let tile = TileId::new(RasterId(0), TileIndex::new(0, 0, 0));
		bus.tile_state_changed(tile, TileState::Valid);

		assert_eq!(seen.lock().unwrap().len(), 1);
	}

	#[test]
	fn panicking_listener_does_not_break_others() {
		let bus = EventBus::new();
		let counter = Arc::new(Mutex::new(0));
		let counter2 = counter.clone();
		bus.subscribe(|_| panic!("boom"));
		bus.subscribe(move |_| *counter2.lock().unwrap() += 1);

		bus.warn("test");

		assert_eq!(*counter.lock().unwrap(), 1);
	}
}
