//! Cancellable delayed messages.
//!
//! A [`Timer`] posts one message into a mailbox after a delay. Cancelling
//! aborts the sleeping task; cancelling twice, or after the message was
//! posted, does nothing. Receivers still have to tolerate a message that was
//! already queued when the timer was cancelled, which is why the manager tags
//! its timer messages with tokens.

use std::time::Duration;

use tokio::{sync::mpsc, task::JoinHandle, time};

#[derive(Debug, Default)]
pub struct Timer {
   handle: Option<JoinHandle<()>>,
}

impl Timer {
   pub fn arm<T: Send + 'static>(mailbox: &mpsc::UnboundedSender<T>, delay: Duration, msg: T) -> Self {
      let mailbox = mailbox.clone();
      let handle = tokio::spawn(async move {
         time::sleep(delay).await;
         let _ = mailbox.send(msg);
      });
      Self {
         handle: Some(handle),
      }
   }

   /// Returns `true` if the timer was still pending.
   pub fn cancel(&mut self) -> bool {
      match self.handle.take() {
         Some(handle) if !handle.is_finished() => {
            handle.abort();
            true
         },
         _ => false,
      }
   }

   pub fn is_armed(&self) -> bool {
      self.handle.as_ref().is_some_and(|h| !h.is_finished())
   }
}

impl Drop for Timer {
   fn drop(&mut self) {
      self.cancel();
   }
}
