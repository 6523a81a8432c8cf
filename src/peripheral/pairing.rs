//! Pairing state machine.
//!
//! Three signals arrive independently during a pairing attempt: the SMP
//! outcome, the delivery of the long-term key, and the deadline. The
//! coordinator folds them into exactly one result per attempt. It owns no
//! timer itself: [`PairingCoordinator::start`] hands out a token that the
//! caller attaches to its deadline message, and stale tokens are ignored.

use std::time::Duration;

use log::{debug, info};
use serde::Serialize;
use thiserror::Error;

use crate::peripheral::{
   device::LinkState,
   protocol::{AssociationModel, AuthType, KeyMaterial, PairingRequest, SmpReason},
};

/// Why a pairing attempt did not produce keys.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingError {
   #[error("Pairing timed out")]
   Timeout,

   #[error("Peripheral disconnected during pairing")]
   Disconnected,

   #[error("Unknown pairing failure (0x{0:02x})")]
   Unknown(u8),

   #[error("{0}")]
   Smp(SmpReason),

   #[error("Peripheral is already paired")]
   AlreadyPaired,

   #[error("Pairing already in progress")]
   AlreadyPairing,
}

impl PairingError {
   /// Maps an SMP Pairing Failed reason code.
   pub fn from_smp_code(code: u8) -> Self {
      SmpReason::from_repr(code).map_or(Self::Unknown(code), Self::Smp)
   }
}

/// Pairing progress of a peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, strum::Display)]
#[strum(serialize_all = "camelCase")]
#[serde(rename_all = "camelCase")]
pub enum PairingStatus {
   #[default]
   Idle,
   Pairing,
   Paired,
   Failed,
   TimedOut,
   Disconnected,
}

impl PairingStatus {
   pub const fn is_terminal(self) -> bool {
      !matches!(self, Self::Idle | Self::Pairing)
   }
}

/// Successful end of a pairing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingOutcome {
   /// Keys were delivered. The negotiated parameters are absent when the key
   /// arrived before the SMP outcome.
   Paired {
      auth_type: Option<AuthType>,
      assoc_model: Option<AssociationModel>,
      keys: KeyMaterial,
   },
   /// The peer completed pairing but never distributed a long-term key.
   NoLtk {
      auth_type: AuthType,
      assoc_model: AssociationModel,
   },
}

pub type PairingResult = std::result::Result<PairingOutcome, PairingError>;

#[derive(Debug)]
struct PairingSession {
   token: u64,
   request: Option<PairingRequest>,
   timeout: Duration,
   negotiated: Option<(AuthType, AssociationModel)>,
}

/// Per-peripheral pairing state.
#[derive(Debug, Default)]
pub struct PairingCoordinator {
   status: PairingStatus,
   session: Option<PairingSession>,
   next_token: u64,
}

impl PairingCoordinator {
   pub fn new() -> Self {
      Self::default()
   }

   pub const fn status(&self) -> PairingStatus {
      self.status
   }

   pub fn is_pairing(&self) -> bool {
      self.status == PairingStatus::Pairing
   }

   /// The custom request of the running attempt, if one was supplied.
   pub fn request(&self) -> Option<&PairingRequest> {
      self.session.as_ref().and_then(|s| s.request.as_ref())
   }

   pub fn timeout(&self) -> Option<Duration> {
      self.session.as_ref().map(|s| s.timeout)
   }

   /// Begins an attempt and returns the token its deadline must carry.
   pub fn start(
      &mut self,
      request: Option<PairingRequest>,
      timeout: Duration,
   ) -> Result<u64, PairingError> {
      match self.status {
         PairingStatus::Paired => return Err(PairingError::AlreadyPaired),
         PairingStatus::Pairing => return Err(PairingError::AlreadyPairing),
         _ => {},
      }

      self.next_token = self.next_token.wrapping_add(1);
      let token = self.next_token;
      self.session = Some(PairingSession {
         token,
         request,
         timeout,
         negotiated: None,
      });
      self.status = PairingStatus::Pairing;
      Ok(token)
   }

   /// Handles the SMP outcome. A successful outcome only records the
   /// negotiated parameters; a failure ends the attempt.
   pub fn on_pairing_outcome(
      &mut self,
      outcome: Result<(AuthType, AssociationModel), u8>,
   ) -> Option<PairingResult> {
      let Some(session) = self.active_session() else {
         debug!("Pairing outcome outside of an attempt: {outcome:?}");
         return None;
      };

      match outcome {
         Ok(negotiated) => {
            session.negotiated = Some(negotiated);
            None
         },
         Err(code) => Some(self.finish(PairingStatus::Failed, Err(PairingError::from_smp_code(code)))),
      }
   }

   /// Handles long-term key delivery, which always ends the attempt.
   pub fn on_key_delivered(&mut self, keys: KeyMaterial) -> Option<PairingResult> {
      let Some(session) = self.active_session() else {
         debug!("Key delivered outside of an attempt");
         return None;
      };

      let negotiated = session.negotiated;
      Some(self.finish(
         PairingStatus::Paired,
         Ok(PairingOutcome::Paired {
            auth_type: negotiated.map(|(a, _)| a),
            assoc_model: negotiated.map(|(_, m)| m),
            keys,
         }),
      ))
   }

   /// Handles the deadline. `link` is the link state at the time it fired.
   ///
   /// The manager settles an attempt through [`Self::on_disconnect`] as soon as
   /// the link drops, so it never reaches the `Disconnected` branch here; that
   /// branch serves callers that drive the deadline against a dead link.
   pub fn on_timer(&mut self, token: u64, link: LinkState) -> Option<PairingResult> {
      let Some(session) = self.active_session() else {
         debug!("Late pairing timer ignored");
         return None;
      };
      if session.token != token {
         debug!("Stale pairing timer {token} ignored");
         return None;
      }

      let result = match session.negotiated {
         None => (PairingStatus::TimedOut, Err(PairingError::Timeout)),
         Some(_) if link == LinkState::Disconnected => {
            (PairingStatus::Disconnected, Err(PairingError::Disconnected))
         },
         Some((auth_type, assoc_model)) => (
            PairingStatus::Paired,
            Ok(PairingOutcome::NoLtk {
               auth_type,
               assoc_model,
            }),
         ),
      };
      Some(self.finish(result.0, result.1))
   }

   /// Handles link termination. An attempt in flight ends as
   /// [`PairingError::Disconnected`]; the coordinator then returns to idle.
   pub fn on_disconnect(&mut self) -> Option<PairingResult> {
      let result = self
         .is_pairing()
         .then(|| self.finish(PairingStatus::Disconnected, Err(PairingError::Disconnected)));
      self.reset();
      result
   }

   /// Abandons the running attempt without reporting. Returns whether there
   /// was one.
   pub fn stop(&mut self) -> bool {
      if !self.is_pairing() {
         return false;
      }
      self.session = None;
      self.status = PairingStatus::Idle;
      true
   }

   pub fn reset(&mut self) {
      self.session = None;
      self.status = PairingStatus::Idle;
   }

   fn active_session(&mut self) -> Option<&mut PairingSession> {
      if self.status != PairingStatus::Pairing {
         return None;
      }
      self.session.as_mut()
   }

   fn finish(&mut self, status: PairingStatus, result: PairingResult) -> PairingResult {
      info!("Pairing finished: {status}");
      self.status = status;
      self.session = None;
      result
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::peripheral::protocol::LongTermKey;

   const DEADLINE: Duration = Duration::from_secs(30);

   fn keys() -> KeyMaterial {
      KeyMaterial {
         ediv: 0x1234,
         rand: [1, 2, 3, 4, 5, 6, 7, 8],
         ltk: LongTermKey::new([0x11; 16]),
      }
   }

   const NEGOTIATED: (AuthType, AssociationModel) =
      (AuthType::SecureConnections, AssociationModel::JustWorks);

   #[test]
   fn test_timeout_without_events() {
      let mut pairing = PairingCoordinator::new();
      let token = pairing.start(None, DEADLINE).unwrap();

      assert_eq!(
         pairing.on_timer(token, LinkState::Connected),
         Some(Err(PairingError::Timeout))
      );
      assert_eq!(pairing.status(), PairingStatus::TimedOut);
   }

   #[test]
   fn test_disconnected_after_outcome() {
      let mut pairing = PairingCoordinator::new();
      let token = pairing.start(None, DEADLINE).unwrap();

      assert_eq!(pairing.on_pairing_outcome(Ok(NEGOTIATED)), None);
      assert_eq!(
         pairing.on_timer(token, LinkState::Disconnected),
         Some(Err(PairingError::Disconnected))
      );
      assert_eq!(pairing.status(), PairingStatus::Disconnected);
   }

   #[test]
   fn test_no_ltk_when_still_connected() {
      let mut pairing = PairingCoordinator::new();
      let token = pairing.start(None, DEADLINE).unwrap();

      pairing.on_pairing_outcome(Ok(NEGOTIATED));
      assert_eq!(
         pairing.on_timer(token, LinkState::Connected),
         Some(Ok(PairingOutcome::NoLtk {
            auth_type: AuthType::SecureConnections,
            assoc_model: AssociationModel::JustWorks,
         }))
      );
      assert_eq!(pairing.status(), PairingStatus::Paired);
   }

   #[test]
   fn test_key_without_prior_outcome() {
      let mut pairing = PairingCoordinator::new();
      let token = pairing.start(None, DEADLINE).unwrap();

      assert_eq!(
         pairing.on_key_delivered(keys()),
         Some(Ok(PairingOutcome::Paired {
            auth_type: None,
            assoc_model: None,
            keys: keys(),
         }))
      );
      // The deadline firing afterwards has no effect.
      assert_eq!(pairing.on_timer(token, LinkState::Connected), None);
      assert_eq!(pairing.status(), PairingStatus::Paired);
   }

   #[test]
   fn test_key_after_outcome_carries_negotiation() {
      let mut pairing = PairingCoordinator::new();
      pairing.start(None, DEADLINE).unwrap();
      pairing.on_pairing_outcome(Ok((AuthType::Legacy, AssociationModel::PasskeyEntry)));

      let Some(Ok(PairingOutcome::Paired {
         auth_type,
         assoc_model,
         ..
      })) = pairing.on_key_delivered(keys())
      else {
         panic!("expected paired outcome");
      };
      assert_eq!(auth_type, Some(AuthType::Legacy));
      assert_eq!(assoc_model, Some(AssociationModel::PasskeyEntry));
   }

   #[test]
   fn test_smp_failure_is_terminal() {
      let mut pairing = PairingCoordinator::new();
      let token = pairing.start(None, DEADLINE).unwrap();

      assert_eq!(
         pairing.on_pairing_outcome(Err(0x05)),
         Some(Err(PairingError::Smp(SmpReason::PairingNotSupported)))
      );
      assert_eq!(pairing.status(), PairingStatus::Failed);
      assert_eq!(pairing.on_key_delivered(keys()), None);
      assert_eq!(pairing.on_timer(token, LinkState::Connected), None);

      assert_eq!(PairingError::from_smp_code(0x42), PairingError::Unknown(0x42));
   }

   #[test]
   fn test_start_rejections() {
      let mut pairing = PairingCoordinator::new();
      pairing.start(None, DEADLINE).unwrap();
      assert_eq!(pairing.start(None, DEADLINE), Err(PairingError::AlreadyPairing));

      pairing.on_key_delivered(keys());
      assert_eq!(pairing.start(None, DEADLINE), Err(PairingError::AlreadyPaired));
   }

   #[test]
   fn test_retry_after_failure() {
      let mut pairing = PairingCoordinator::new();
      let first = pairing.start(None, DEADLINE).unwrap();
      pairing.on_timer(first, LinkState::Connected);

      let second = pairing.start(None, DEADLINE).unwrap();
      assert_ne!(first, second);
      assert_eq!(pairing.on_timer(first, LinkState::Connected), None);
      assert!(pairing.is_pairing());
   }

   #[test]
   fn test_stop_is_idempotent() {
      let mut pairing = PairingCoordinator::new();
      let token = pairing.start(None, DEADLINE).unwrap();

      assert!(pairing.stop());
      assert!(!pairing.stop());
      assert_eq!(pairing.status(), PairingStatus::Idle);
      assert_eq!(pairing.on_timer(token, LinkState::Connected), None);
      assert_eq!(pairing.on_pairing_outcome(Ok(NEGOTIATED)), None);
   }

   #[test]
   fn test_disconnect_resolves_and_resets() {
      let mut pairing = PairingCoordinator::new();
      pairing.start(None, DEADLINE).unwrap();
      pairing.on_pairing_outcome(Ok(NEGOTIATED));

      assert_eq!(pairing.on_disconnect(), Some(Err(PairingError::Disconnected)));
      assert_eq!(pairing.status(), PairingStatus::Idle);
      assert_eq!(pairing.on_disconnect(), None);
      assert!(pairing.start(None, DEADLINE).is_ok());
   }
}
