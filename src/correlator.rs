use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::{Gt06Error, Result};
use crate::Frame;

/// Rendezvous between the reader task and callers awaiting a server
/// acknowledgement, keyed by `(protocol_no, serial)`.
///
/// The reader stores every non-command inbound frame; a waiter resolves
/// as soon as its key appears, removing the record. Some servers echo
/// the request protocol number instead of the request serial, so a
/// record stored under `serial == protocol_no` satisfies any waiter on
/// that protocol.
#[derive(Debug, Default)]
pub(crate) struct Correlator {
    records: Mutex<HashMap<u8, HashMap<u16, Frame>>>,
    notify: Notify,
    closed: AtomicBool,
}

impl Correlator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Forget records of a previous connection and accept waiters again.
    pub(crate) fn reset(&self) {
        self.records.lock().unwrap().clear();
        self.closed.store(false, Ordering::SeqCst);
    }

    /// Store an inbound frame and wake every waiter.
    pub(crate) fn deliver(&self, frame: Frame) {
        self.records
            .lock()
            .unwrap()
            .entry(frame.protocol_no)
            .or_default()
            .insert(frame.serial, frame);
        self.notify.notify_waiters();
    }

    /// Wake all waiters with [Gt06Error::NotConnected]; called when the
    /// reader exits.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn take(&self, protocol_no: u8, serial: u16) -> Option<Frame> {
        let mut records = self.records.lock().unwrap();
        let by_serial = records.get_mut(&protocol_no)?;
        let matched = by_serial
            .remove(&serial)
            // the protocol-number echo fallback
            .or_else(|| by_serial.remove(&(protocol_no as u16)));
        if by_serial.is_empty() {
            records.remove(&protocol_no);
        }
        matched
    }

    /// Wait until the reader delivers an acknowledgement for
    /// `(protocol_no, serial)`.
    ///
    /// # Errors
    ///
    ///  - [Gt06Error::AckTimeout] when `timeout` elapses first
    ///  - [Gt06Error::NotConnected] as soon as the connection is lost
    pub(crate) async fn wait(&self, protocol_no: u8, serial: u16, timeout: Duration) -> Result<Frame> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a delivery between the check
            // and the await is not missed.
            notified.as_mut().enable();

            if self.closed.load(Ordering::SeqCst) {
                return Err(Gt06Error::NotConnected);
            }
            if let Some(frame) = self.take(protocol_no, serial) {
                return Ok(frame);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(Gt06Error::AckTimeout(timeout));
                }
            }
        }
    }
}
