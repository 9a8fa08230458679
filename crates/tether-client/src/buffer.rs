//! Sliding window of unacknowledged invocation-family messages.
//!
//! Active only when the transport advertises stateful reconnect. Outbound
//! invocation-family frames are held here until the server acknowledges
//! them, so a replacement connection can replay exactly what the server
//! never saw. Inbound invocation-family frames are deduplicated by
//! sequence number so replays from the server are dropped.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;

use tether_wire::{HubMessage, Payload};

use crate::HubError;

/// How long acknowledgements are coalesced before one Ack frame is sent.
pub(crate) const ACK_RATE: Duration = Duration::from_secs(1);

/// Verdict of the inbound gate for one message.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Gate {
    /// Dispatch the message, or drop it.
    pub process: bool,
    /// The ack timer transitioned from disarmed to armed.
    pub arm_ack_timer: bool,
}

/// Outcome of registering one outbound message.
pub(crate) struct SendTicket {
    /// Forward the frame to the transport now. False while a reconnect is
    /// in progress; the resend pass will carry the frame instead.
    pub forward: bool,
    /// Present when backpressure engaged for this message. Awaiting it
    /// blocks the sender until the item is released or the buffer is
    /// disposed.
    pub backpressure: Option<oneshot::Receiver<Result<(), HubError>>>,
}

struct BufferedItem {
    /// Local message number, 1-based.
    id: u64,
    size: usize,
    payload: Payload,
    /// Pending backpressure handle, completed on release.
    release: Option<oneshot::Sender<Result<(), HubError>>>,
}

struct BufferState {
    /// Unacked outbound items. Front = oldest (lowest id).
    items: VecDeque<BufferedItem>,
    /// Invocation-family messages ever sent; supplies local ids.
    total_message_count: u64,
    buffered_byte_count: usize,
    reconnect_in_progress: bool,
    /// Inbound invocation-family messages are dropped until a Sequence
    /// frame arrives.
    wait_for_sequence: bool,
    next_receiving_sequence_id: u64,
    latest_received_sequence_id: u64,
    ack_timer_armed: bool,
}

pub(crate) struct MessageBuffer {
    buffer_size: usize,
    state: Mutex<BufferState>,
}

impl MessageBuffer {
    pub(crate) fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size,
            state: Mutex::new(BufferState {
                items: VecDeque::new(),
                total_message_count: 0,
                buffered_byte_count: 0,
                reconnect_in_progress: false,
                wait_for_sequence: false,
                next_receiving_sequence_id: 1,
                latest_received_sequence_id: 0,
                ack_timer_armed: false,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register one outbound message before it is handed to the transport.
    ///
    /// Invocation-family messages are assigned the next local id and
    /// buffered until acknowledged; backpressure engages once the buffered
    /// byte count reaches the configured budget.
    pub(crate) fn prepare_send(&self, payload: &Payload, invocation_family: bool) -> SendTicket {
        let mut st = self.lock();
        let mut backpressure = None;
        if invocation_family {
            st.total_message_count += 1;
            let id = st.total_message_count;
            let size = payload.len();
            st.buffered_byte_count += size;
            let release = if st.buffered_byte_count >= self.buffer_size {
                let (tx, rx) = oneshot::channel();
                backpressure = Some(rx);
                Some(tx)
            } else {
                None
            };
            st.items.push_back(BufferedItem {
                id,
                size,
                payload: payload.clone(),
                release,
            });
        }
        SendTicket {
            forward: !st.reconnect_in_progress,
            backpressure,
        }
    }

    /// Process an inbound Ack: drop the acknowledged prefix, then release
    /// backpressure on still-buffered items while the byte count sits
    /// below budget.
    pub(crate) fn ack(&self, sequence_id: u64) {
        let mut guard = self.lock();
        let st = &mut *guard;
        let mut acked = 0;
        for item in st.items.iter_mut() {
            if item.id <= sequence_id {
                acked += 1;
                st.buffered_byte_count -= item.size;
                if let Some(release) = item.release.take() {
                    let _ = release.send(Ok(()));
                }
            } else if st.buffered_byte_count < self.buffer_size {
                if let Some(release) = item.release.take() {
                    let _ = release.send(Ok(()));
                }
            } else {
                break;
            }
        }
        st.items.drain(..acked);
    }

    /// Gate one inbound message.
    ///
    /// After a disconnect only a Sequence frame is admitted; otherwise
    /// invocation-family messages are numbered and duplicates dropped.
    pub(crate) fn should_process(&self, message: &HubMessage) -> Gate {
        let mut st = self.lock();
        if st.wait_for_sequence {
            if matches!(message, HubMessage::Sequence(_)) {
                st.wait_for_sequence = false;
                Gate {
                    process: true,
                    arm_ack_timer: false,
                }
            } else {
                Gate {
                    process: false,
                    arm_ack_timer: false,
                }
            }
        } else if !message.is_invocation_family() {
            Gate {
                process: true,
                arm_ack_timer: false,
            }
        } else {
            let current = st.next_receiving_sequence_id;
            st.next_receiving_sequence_id += 1;
            if current <= st.latest_received_sequence_id {
                // Duplicate from a server replay. Re-ack the exact edge so
                // the server can trim, but never dispatch.
                let arm = if current == st.latest_received_sequence_id {
                    arm_ack_timer(&mut st)
                } else {
                    false
                };
                Gate {
                    process: false,
                    arm_ack_timer: arm,
                }
            } else {
                st.latest_received_sequence_id = current;
                let arm = arm_ack_timer(&mut st);
                Gate {
                    process: true,
                    arm_ack_timer: arm,
                }
            }
        }
    }

    /// Apply an inbound Sequence frame.
    ///
    /// A rewind replays the dedup window; pointing past what we have
    /// received is fatal.
    pub(crate) fn reset_sequence(&self, sequence_id: u64) -> Result<(), HubError> {
        let mut st = self.lock();
        if sequence_id > st.next_receiving_sequence_id {
            return Err(HubError::SequenceViolation);
        }
        st.next_receiving_sequence_id = sequence_id;
        Ok(())
    }

    /// The underlying connection is gone: buffer new sends without
    /// forwarding, and require a Sequence frame before inbound traffic.
    pub(crate) fn disconnected(&self) {
        let mut st = self.lock();
        st.reconnect_in_progress = true;
        st.wait_for_sequence = true;
    }

    /// Snapshot for replay on a fresh underlying connection: the sequence
    /// base and every buffered payload in order.
    pub(crate) fn resend_snapshot(&self) -> (u64, Vec<Payload>) {
        let st = self.lock();
        let base = st
            .items
            .front()
            .map(|item| item.id)
            .unwrap_or(st.total_message_count + 1);
        let payloads = st.items.iter().map(|item| item.payload.clone()).collect();
        (base, payloads)
    }

    /// Replay finished: forward subsequent sends again.
    pub(crate) fn finish_resend(&self) {
        self.lock().reconnect_in_progress = false;
    }

    /// The ack timer fired. Returns the sequence id to acknowledge, or
    /// `None` while a reconnect is in progress.
    pub(crate) fn on_ack_fire(&self) -> Option<u64> {
        let mut st = self.lock();
        st.ack_timer_armed = false;
        if st.reconnect_in_progress {
            None
        } else {
            Some(st.latest_received_sequence_id)
        }
    }

    /// Permanently close the buffer: every sender still waiting on
    /// backpressure unblocks with the given error.
    pub(crate) fn dispose(&self, error: &HubError) {
        let mut st = self.lock();
        for item in st.items.iter_mut() {
            if let Some(release) = item.release.take() {
                let _ = release.send(Err(error.clone()));
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn buffered_byte_count(&self) -> usize {
        self.lock().buffered_byte_count
    }

    #[cfg(test)]
    pub(crate) fn buffered_item_sizes(&self) -> Vec<usize> {
        self.lock().items.iter().map(|item| item.size).collect()
    }
}

fn arm_ack_timer(st: &mut BufferState) -> bool {
    if st.ack_timer_armed {
        false
    } else {
        st.ack_timer_armed = true;
        true
    }
}
