//! # Event Bus
//!
//! Lifecycle events travel two paths at once:
//!
//! - **Reliable**: appended to a stream and consumed through consumer groups.
//!   Delivery is at-least-once; an entry is acknowledged only after its
//!   handler succeeds, and entries held too long by a dead consumer are taken
//!   over by a live one.
//! - **Real-time**: pushed over pub/sub to the event's specific name and to
//!   its `family.*` wildcard. No acknowledgement and no replay.
//!
//! The fast store behind both paths is abstracted by the traits in
//! [`store`], with Redis and in-memory implementations.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use rdial_event_bus::{handler_fn, EventBus, EventBusConfig, MemoryStore, NewEvent};
//!
//! # tokio_test::block_on(async {
//! let bus = EventBus::with_store(Arc::new(MemoryStore::new()), EventBusConfig::default());
//! bus.initialize().await.unwrap();
//! let subscription = bus
//!     .subscribe("call.*", handler_fn(|event| async move {
//!         println!("{} {}", event.event, event.id);
//!         Ok(())
//!     }), "worker-1")
//!     .await
//!     .unwrap();
//!
//! bus.publish("call.*", NewEvent::new("call.answered", "tenant-1", serde_json::json!({})))
//!     .await
//!     .unwrap();
//! let recent = bus.get_events(10).await.unwrap();
//! assert_eq!(recent[0].event, "call.answered");
//! subscription.unsubscribe().await;
//! # })
//! ```

pub mod bus;
pub mod error;
pub mod event;
pub mod pattern;
pub mod store;

pub use bus::{group_key, handler_fn, EventBus, EventBusConfig, EventHandler, HandlerFn, Published, Subscription};
pub use error::{EventBusError, Result};
pub use event::{channels, names, wildcard_of, Event, NewEvent};
pub use pattern::matches_pattern;
pub use store::{
    KeyValueStore, MemoryStore, PubSub, PubSubReceiver, RedisStore, StoreError, StoreResult, StreamEntry, StreamLog,
};
