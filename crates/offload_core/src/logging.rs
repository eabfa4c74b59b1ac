//! Application logging callback.
//!
//! [`CallbackLayer`] is a `tracing_subscriber` layer that hands every event
//! to an application-supplied [`LoggingCallback`] while its [`DebugSwitch`]
//! is on. Install it next to (or instead of) the usual `fmt` layer:
//!
//! ```ignore
//! let (layer, switch) = CallbackLayer::new(|level: Level, msg: &str| eprintln!("{level} {msg}"));
//! tracing_subscriber::registry().with(layer).init();
//! switch.on();
//! ```

use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

/// Receives formatted log lines.
pub trait LoggingCallback: Send + Sync + 'static {
    fn log(&self, level: Level, message: &str);
}

impl<F> LoggingCallback for F
where
    F: Fn(Level, &str) + Send + Sync + 'static,
{
    fn log(&self, level: Level, message: &str) {
        self(level, message)
    }
}

/// Runtime on/off switch for a [`CallbackLayer`]. Starts off.
#[derive(Debug, Clone, Default)]
pub struct DebugSwitch(Arc<AtomicBool>);

impl DebugSwitch {
    pub fn on(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn off(&self) {
        self.0.store(false, Ordering::Relaxed);
    }

    pub fn is_on(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

pub struct CallbackLayer {
    callback: Box<dyn LoggingCallback>,
    switch: DebugSwitch,
}

impl CallbackLayer {
    pub fn new(callback: impl LoggingCallback) -> (Self, DebugSwitch) {
        let switch = DebugSwitch::default();
        let layer = Self {
            callback: Box::new(callback),
            switch: switch.clone(),
        };
        (layer, switch)
    }
}

impl fmt::Debug for CallbackLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackLayer")
            .field("enabled", &self.switch.is_on())
            .finish_non_exhaustive()
    }
}

impl<S: Subscriber> Layer<S> for CallbackLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if !self.switch.is_on() {
            return;
        }
        let mut line = LineVisitor::default();
        event.record(&mut line);
        self.callback
            .log(*event.metadata().level(), &line.finish(event.metadata().target()));
    }
}

/// `target: message key=value ...`
#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: String,
}

impl LineVisitor {
    fn finish(self, target: &str) -> String {
        format!("{target}: {}{}", self.message, self.fields)
    }
}

impl Visit for LineVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}
