//! Observable values
//!
//! Cached instrument readings built on `tokio::sync::watch`. A driver that
//! polls hardware in the background (the thermometer) publishes each reading
//! through an [`Observable`]; any number of subscribers can await changes
//! without issuing commands of their own.
//!
//! # Example
//!
//! ```rust,ignore
//! let temperature = Observable::new("temperature", None::<f64>).with_units("°C");
//!
//! let mut rx = temperature.subscribe();
//! tokio::spawn(async move {
//!     while rx.changed().await.is_ok() {
//!         println!("now {:?}", *rx.borrow());
//!     }
//! });
//!
//! temperature.set(Some(21.5));
//! ```

use std::sync::Arc;
use tokio::sync::watch;

/// A thread-safe value with change notifications.
///
/// Clones share the same channel: a `set` through any clone is seen by every
/// subscriber of every clone.
pub struct Observable<T>
where
    T: Clone + Send + Sync + 'static,
{
    sender: Arc<watch::Sender<T>>,
    name: Arc<str>,
    units: Option<Arc<str>>,
}

impl<T: Clone + Send + Sync + 'static> std::fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observable")
            .field("name", &self.name)
            .field("units", &self.units)
            .field("subscribers", &self.sender.receiver_count())
            .finish_non_exhaustive()
    }
}

impl<T: Clone + Send + Sync + 'static> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            sender: Arc::clone(&self.sender),
            name: Arc::clone(&self.name),
            units: self.units.clone(),
        }
    }
}

impl<T> Observable<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a new observable with an initial value.
    pub fn new(name: impl Into<String>, initial_value: T) -> Self {
        let (sender, _) = watch::channel(initial_value);
        Self {
            sender: Arc::new(sender),
            name: Arc::from(name.into()),
            units: None,
        }
    }

    /// Attach physical units.
    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.units = Some(Arc::from(units.into()));
        self
    }

    /// Name given at construction.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Units, if any.
    pub fn units(&self) -> Option<&str> {
        self.units.as_deref()
    }

    /// Get the current value (clone).
    pub fn get(&self) -> T {
        self.sender.borrow().clone()
    }

    /// Replace the value and notify all subscribers.
    pub fn set(&self, value: T) {
        self.sender.send_replace(value);
    }

    /// Subscribe to changes.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_get_set() {
        let obs = Observable::new("speed", 100i64);
        assert_eq!(obs.get(), 100);
        obs.set(42);
        assert_eq!(obs.get(), 42);
    }

    #[test]
    fn test_metadata() {
        let obs = Observable::new("temperature", None::<f64>).with_units("°C");
        assert_eq!(obs.name(), "temperature");
        assert_eq!(obs.units(), Some("°C"));
    }

    #[tokio::test]
    async fn test_subscriber_sees_update() {
        let obs = Observable::new("temperature", None::<f64>);
        let mut rx = obs.subscribe();

        obs.set(Some(21.5));

        tokio::time::timeout(Duration::from_millis(100), rx.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*rx.borrow(), Some(21.5));
    }

    #[test]
    fn test_clones_share_state() {
        let obs = Observable::new("x", 0i64);
        let clone = obs.clone();
        clone.set(7);
        assert_eq!(obs.get(), 7);
    }
}
