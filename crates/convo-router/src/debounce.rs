// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-session debounce buffering for active-mode non-trigger messages.
//! At most one buffer exists per session at any time; buffers never mix
//! messages from different sessions; a mention or reply pre-empts and
//! clears the buffer for its session rather than flushing it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};

use convo_bus::AdapterMessageCreated;

/// A buffered run of active-mode messages awaiting the debounce flush.
#[derive(Debug, Clone)]
pub struct DebounceBuffer {
    pub session_id: String,
    pub session_config_id: String,
    pub parent_channel_id: Option<String>,
    pub messages: Vec<AdapterMessageCreated>,
}

struct BufferSlot {
    buffer: DebounceBuffer,
    generation: u64,
}

/// Owns the live per-session buffers and the timers that flush them.
/// `flush_tx` emits one [`DebounceBuffer`] per completed debounce window;
/// the router drains it to run the gate and publish `cmd.request`.
pub struct DebounceManager {
    slots: Arc<Mutex<HashMap<String, BufferSlot>>>,
    flush_tx: mpsc::UnboundedSender<DebounceBuffer>,
}

impl DebounceManager {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DebounceBuffer>) {
        let (flush_tx, flush_rx) = mpsc::unbounded_channel();
        (Self { slots: Arc::new(Mutex::new(HashMap::new())), flush_tx }, flush_rx)
    }

    /// Append `message` to the session's buffer (creating it if absent)
    /// and (re)arm its flush timer for `debounce_ms` from now. The window
    /// is re-read from config on every push, so a hot-reloaded
    /// `activeDebounceMs` takes effect on the session's next message.
    pub async fn push(
        &self,
        session_id: &str,
        session_config_id: &str,
        parent_channel_id: Option<String>,
        message: AdapterMessageCreated,
        debounce_ms: u64,
    ) {
        let mut slots = self.slots.lock().await;
        let slot = slots.entry(session_id.to_string()).or_insert_with(|| BufferSlot {
            buffer: DebounceBuffer {
                session_id: session_id.to_string(),
                session_config_id: session_config_id.to_string(),
                parent_channel_id: parent_channel_id.clone(),
                messages: Vec::new(),
            },
            generation: 0,
        });
        slot.buffer.messages.push(message);
        slot.generation += 1;
        let generation = slot.generation;
        drop(slots);

        let slots = self.slots.clone();
        let flush_tx = self.flush_tx.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(debounce_ms)).await;
            let mut slots = slots.lock().await;
            if let Some(slot) = slots.get(&session_id) {
                if slot.generation == generation {
                    let slot = slots.remove(&session_id).unwrap();
                    let _ = flush_tx.send(slot.buffer);
                }
            }
        });
    }

    /// Pre-empt the session's buffer: a mention or reply arrived, so the
    /// buffered run is dropped rather than flushed. Bumping the generation
    /// makes any in-flight timer a no-op.
    pub async fn clear(&self, session_id: &str) {
        let mut slots = self.slots.lock().await;
        if let Some(slot) = slots.get_mut(session_id) {
            slot.generation += 1;
        }
        slots.remove(session_id);
    }

    pub async fn has_buffer(&self, session_id: &str) -> bool {
        self.slots.lock().await.contains_key(session_id)
    }
}
