//! File-watch reload trigger for `ConfigSource::File`, built on `notify` /
//! `notify-debouncer-full`. Coalesces editor-save bursts into a single
//! reload signal.

use std::path::Path;
use std::time::Duration;

use notify::RecursiveMode;
use notify_debouncer_full::{DebounceEventResult, Debouncer, RecommendedCache, new_debouncer};
use tokio::sync::mpsc;

const DEBOUNCE: Duration = Duration::from_millis(300);

struct Forwarder(mpsc::Sender<()>);

impl notify_debouncer_full::DebounceEventHandler for Forwarder {
	fn handle_event(&mut self, result: DebounceEventResult) {
		match result {
			Ok(events) if !events.is_empty() => {
				let _ = self.0.try_send(());
			}
			Ok(_) => {}
			Err(errors) => {
				for e in errors {
					tracing::warn!(error = %e, "config file watch error");
				}
			}
		}
	}
}

/// Watches one config file path and delivers a `()` on `reloads` each time
/// the debounced watcher observes a change.
pub struct ReloadWatcher {
	_debouncer: Debouncer<notify::RecommendedWatcher, RecommendedCache>,
	pub reloads: mpsc::Receiver<()>,
}

impl ReloadWatcher {
	pub fn watch(path: &Path) -> Result<Self, notify::Error> {
		let (tx, rx) = mpsc::channel(1);
		let mut debouncer = new_debouncer(DEBOUNCE, None, Forwarder(tx))?;
		debouncer.watch(path, RecursiveMode::NonRecursive)?;
		Ok(ReloadWatcher {
			_debouncer: debouncer,
			reloads: rx,
		})
	}
}
