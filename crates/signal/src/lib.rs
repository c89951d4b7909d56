#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! A signal is either a `TimerTick` (triggered by a configured timer), a
//! `CacheExpiry` (triggered by the cache service when a TTL-backed entry
//! expires), a batch of messages, or a `Stop` request. A `SignalReceiver` is
//! the interface through which a processor or an exporter receives new
//! signals from the runtime.

use std::{
    fmt::{Display, Formatter},
    time::{Duration, Instant},
};

use futures::{
    future::{select, Either},
    pin_mut,
};

/// Runtime signal that can be received by a processor or an exporter.
#[derive(Debug)]
#[non_exhaustive]
pub enum Signal<Msg: 'static + Clone + Send> {
    /// Signal variant triggered by a timer.
    TimerTick {
        /// Timestamp of the signal.
        instant: Instant,
        /// Origin of the timer (could be a processor or an exporter).
        timer_source: usize,
        /// Identifier of the timer registered via the timer service, when
        /// this tick was raised by a named per-component timer rather than
        /// the component's own fixed-interval wake-up.
        timer_id: Option<String>,
        /// Payload captured when the timer was registered.
        payload: Option<serde_yaml::Value>,
    },
    /// Signal variant triggered when a cache entry registered with a TTL has
    /// expired.
    CacheExpiry {
        /// Name of the cache the entry expired from.
        cache_name: String,
        /// Key of the entry that expired.
        key: String,
        /// Metadata captured alongside the entry when it was added.
        metadata: Option<serde_yaml::Value>,
        /// The value that expired.
        expired_data: Option<serde_yaml::Value>,
    },
    /// Signal variant triggered by the reception of a batch of messages.
    Messages {
        /// Messages received.
        messages: Vec<Msg>,
    },
    /// Signal variant received when the processor or exporter must stop.
    Stop,
}

/// Set of methods exposed by a signal.
impl<Msg> Signal<Msg>
where
    Msg: 'static + Clone + Send,
{
    /// Returns the name of this signal.
    pub fn name(&self) -> &'static str {
        match self {
            Signal::TimerTick { .. } => "TimerTick",
            Signal::CacheExpiry { .. } => "CacheExpiry",
            Signal::Messages { .. } => "Messages",
            Signal::Stop => "Stop",
        }
    }
}

impl<Msg> Display for Signal<Msg>
where
    Msg: 'static + Clone + Send,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A signal received out-of-band from the message channel (timer tick or
/// cache expiry); multiplexed into `Signal` by the `SignalReceiver`.
#[derive(Debug)]
pub enum SideSignal {
    /// A cache entry expired.
    CacheExpiry {
        /// Name of the cache the entry expired from.
        cache_name: String,
        /// Key of the entry that expired.
        key: String,
        /// Metadata captured alongside the entry when it was added.
        metadata: Option<serde_yaml::Value>,
        /// The value that expired.
        expired_data: Option<serde_yaml::Value>,
    },
    /// A named per-component timer fired.
    Timer {
        /// Identifier of the timer, as passed to `add_timer`.
        timer_id: String,
        /// Payload captured when the timer was registered.
        payload: Option<serde_yaml::Value>,
    },
}

/// A receiver that can be used to receive signals from the runtime.
pub enum SignalReceiver<Msg>
where
    Msg: 'static + Clone + Send,
{
    /// A signal receiver with only a flume receiver of message batches.
    Receiver {
        /// A flume MPMC receiver.
        receiver: flume::Receiver<Vec<Msg>>,
    },
    /// A signal receiver with a flume receiver and a tokio interval timer.
    ReceiverInterval {
        /// A flume MPMC receiver.
        receiver: flume::Receiver<Vec<Msg>>,
        /// The origin of the timer.
        timer_source: usize,
        /// The interval of the timer.
        interval: tokio::time::Interval,
    },
    /// A signal receiver with a flume receiver and a side-channel receiver
    /// carrying cache-expiry notifications.
    ReceiverWithSideChannel {
        /// A flume MPMC receiver.
        receiver: flume::Receiver<Vec<Msg>>,
        /// A flume receiver of side signals (e.g. cache expiry).
        side_channel: flume::Receiver<SideSignal>,
    },
}

impl<Msg> SignalReceiver<Msg>
where
    Msg: 'static + Clone + Send,
{
    /// Creates a new receiver that can be used to receive signals from the
    /// runtime.
    pub fn with_receiver(receiver: flume::Receiver<Vec<Msg>>) -> Self {
        SignalReceiver::Receiver { receiver }
    }

    /// Creates a new receiver that can be used to receive signals from the
    /// runtime. The receiver will also receive Signal::TimerTick every
    /// `duration`.
    pub fn with_receiver_timer(receiver: flume::Receiver<Vec<Msg>>, duration: Duration, timer_source: usize) -> Self {
        SignalReceiver::ReceiverInterval {
            receiver,
            timer_source,
            interval: tokio::time::interval(duration),
        }
    }

    /// Creates a new receiver multiplexing message batches with side signals
    /// (e.g. cache expiry notifications pushed by the cache service).
    pub fn with_side_channel(receiver: flume::Receiver<Vec<Msg>>, side_channel: flume::Receiver<SideSignal>) -> Self {
        SignalReceiver::ReceiverWithSideChannel { receiver, side_channel }
    }

    /// Returns the next signal to process.
    pub async fn recv(&mut self) -> Signal<Msg> {
        match self {
            SignalReceiver::Receiver { receiver } => match receiver.recv_async().await {
                Ok(messages) => Signal::Messages { messages },
                Err(err) => {
                    tracing::warn!("Error receiving messages (Flume MPMC channel): {}", err);
                    Signal::Stop
                }
            },
            SignalReceiver::ReceiverInterval {
                receiver,
                interval,
                timer_source,
            } => {
                let interval_fut = interval.tick();
                let receiver_fut = receiver.recv_async();

                pin_mut!(interval_fut, receiver_fut);

                match select(interval_fut, receiver_fut).await {
                    Either::Left((instant, _)) => Signal::TimerTick {
                        instant: instant.into_std(),
                        timer_source: *timer_source,
                        timer_id: None,
                        payload: None,
                    },
                    Either::Right((messages, _)) => match messages {
                        Ok(messages) => Signal::Messages { messages },
                        Err(err) => {
                            tracing::warn!("Error receiving messages (Flume MPMC channel): {}", err);
                            Signal::Stop
                        }
                    },
                }
            }
            SignalReceiver::ReceiverWithSideChannel { receiver, side_channel } => {
                let side_fut = side_channel.recv_async();
                let receiver_fut = receiver.recv_async();

                pin_mut!(side_fut, receiver_fut);

                match select(side_fut, receiver_fut).await {
                    Either::Left((side, _)) => match side {
                        Ok(SideSignal::CacheExpiry {
                            cache_name,
                            key,
                            metadata,
                            expired_data,
                        }) => Signal::CacheExpiry {
                            cache_name,
                            key,
                            metadata,
                            expired_data,
                        },
                        Ok(SideSignal::Timer { timer_id, payload }) => Signal::TimerTick {
                            instant: Instant::now(),
                            timer_source: 0,
                            timer_id: Some(timer_id),
                            payload,
                        },
                        Err(_) => Signal::Stop,
                    },
                    Either::Right((messages, _)) => match messages {
                        Ok(messages) => Signal::Messages { messages },
                        Err(err) => {
                            tracing::warn!("Error receiving messages (Flume MPMC channel): {}", err);
                            Signal::Stop
                        }
                    },
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use crate::{Signal, SignalReceiver};

    #[tokio::test]
    async fn test() {
        let (sender, receiver) = flume::bounded(10);
        let mut message_stream = SignalReceiver::with_receiver_timer(receiver, Duration::from_secs(1), 0);

        sender.send_async(vec!["test1".to_string()]).await.unwrap();
        sender.send_async(vec!["test2".to_string()]).await.unwrap();

        match message_stream.recv().await {
            Signal::Messages { messages } => {
                assert_eq!(messages.len(), 1);
                assert_eq!(messages[0], "test1".to_string());
            }
            other => panic!("unexpected signal: {other}"),
        }

        match message_stream.recv().await {
            Signal::Messages { messages } => {
                assert_eq!(messages.len(), 1);
                assert_eq!(messages[0], "test2".to_string());
            }
            other => panic!("unexpected signal: {other}"),
        }

        match message_stream.recv().await {
            Signal::TimerTick { .. } => { /*OK*/ }
            other => panic!("unexpected signal: {other}"),
        }
    }

    #[tokio::test]
    async fn test_side_channel() {
        let (sender, receiver) = flume::bounded::<Vec<String>>(10);
        let (side_sender, side_receiver) = flume::bounded(10);
        let mut message_stream = SignalReceiver::with_side_channel(receiver, side_receiver);

        side_sender
            .send_async(crate::SideSignal::CacheExpiry {
                cache_name: "sessions".into(),
                key: "abc".into(),
                metadata: None,
                expired_data: None,
            })
            .await
            .unwrap();

        match message_stream.recv().await {
            Signal::CacheExpiry { cache_name, key, .. } => {
                assert_eq!(cache_name, "sessions");
                assert_eq!(key, "abc");
            }
            other => panic!("unexpected signal: {other}"),
        }

        drop(sender);
    }
}
