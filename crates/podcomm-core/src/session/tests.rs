//! Session-level tests over a scripted mock transport.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use chrono::{Duration, Utc};

use super::{CancelDeliveryResult, DeliveryCommandResult, PodSession, PodSessionDelegate};
use crate::alerts::{AlertSet, BeepType};
use crate::dose::{DoseKind, ScheduledCertainty};
use crate::error::PodCommsError;
use crate::nonce::NonceState;
use crate::pod_state::{MessageTransportState, PodState, SetupProgress};
use crate::protocol::{
    DeliveryStatus, DeliveryType, DetailedStatus, FaultEventCode, InsulinSchedule, Message,
    MessageBlock, MessageBlockType, PodInfo, PodInfoResponse, PodInfoType, PodProgressStatus,
    PulseLog, StatusResponse,
};
use crate::transport::{MessageTransport, TransportError};
use crate::units::Units;

const ADDRESS: u32 = 0x1f0d_3e0a;
const LOT: u32 = 43620;
const TID: u32 = 4711;

/// One scripted transport reply.
enum Reply {
    /// Reply with these blocks from the pod's address.
    Blocks(Vec<MessageBlock>),
    /// Reply with these blocks from a different address (crosstalk).
    Addressed(u32, Vec<MessageBlock>),
    /// Fail at the transport layer.
    Error(TransportError),
}

/// Scripted transport capturing every sent message.
struct MockTransport {
    sent: Rc<RefCell<Vec<Message>>>,
    replies: RefCell<VecDeque<Reply>>,
    message_number: u8,
}

impl MockTransport {
    fn new(replies: Vec<Reply>) -> (Self, Rc<RefCell<Vec<Message>>>) {
        let sent = Rc::new(RefCell::new(Vec::new()));
        (
            Self {
                sent: Rc::clone(&sent),
                replies: RefCell::new(replies.into()),
                message_number: 0,
            },
            sent,
        )
    }
}

impl MessageTransport for MockTransport {
    fn send_message(&mut self, message: &Message) -> Result<Message, TransportError> {
        self.sent.borrow_mut().push(message.clone());
        self.message_number = self.message_number.wrapping_add(2);
        match self.replies.borrow_mut().pop_front() {
            Some(Reply::Blocks(blocks)) => {
                Ok(Message::new(ADDRESS, self.message_number - 1, blocks, false))
            },
            Some(Reply::Addressed(address, blocks)) => {
                Ok(Message::new(address, self.message_number - 1, blocks, false))
            },
            Some(Reply::Error(error)) => Err(error),
            None => Err(TransportError::NoResponse),
        }
    }

    fn message_number(&self) -> u8 {
        self.message_number
    }

    fn transport_state(&self) -> MessageTransportState {
        MessageTransportState {
            packet_number: self.message_number.wrapping_mul(2),
            message_number: self.message_number,
        }
    }
}

fn base_status(delivery_status: DeliveryStatus) -> StatusResponse {
    StatusResponse {
        delivery_status,
        pod_progress: PodProgressStatus::AboveFiftyUnits,
        insulin_delivered: Units::from_pulses(100),
        bolus_not_delivered: Units::default(),
        active_alerts: AlertSet::EMPTY,
        time_active: Duration::minutes(60),
        reservoir_level: Some(Units::from_pulses(900)),
    }
}

fn status_reply(delivery_status: DeliveryStatus) -> Reply {
    Reply::Blocks(vec![MessageBlock::StatusResponse(base_status(
        delivery_status,
    ))])
}

fn progress_reply(pod_progress: PodProgressStatus) -> Reply {
    let mut status = base_status(DeliveryStatus::SUSPENDED);
    status.pod_progress = pod_progress;
    Reply::Blocks(vec![MessageBlock::StatusResponse(status)])
}

fn faulted_detailed(bolus_not_delivered: Units, code: FaultEventCode) -> DetailedStatus {
    DetailedStatus {
        pod_progress: PodProgressStatus::FaultEventOccurred,
        delivery_status: DeliveryStatus::SUSPENDED,
        bolus_not_delivered,
        insulin_delivered: Units::from_pulses(150),
        reservoir_level: None,
        time_active: Duration::minutes(90),
        fault_event_code: code,
        fault_time: Some(Duration::minutes(89)),
        unacknowledged_alerts: AlertSet::EMPTY,
    }
}

fn fault_reply(bolus_not_delivered: Units, code: FaultEventCode) -> Reply {
    Reply::Blocks(vec![MessageBlock::PodInfoResponse(PodInfoResponse {
        info_type: PodInfoType::DetailedStatus,
        info: PodInfo::DetailedStatus(faulted_detailed(bolus_not_delivered, code)),
    })])
}

fn make_session(replies: Vec<Reply>) -> (PodSession<MockTransport>, Rc<RefCell<Vec<Message>>>) {
    let (transport, sent) = MockTransport::new(replies);
    let state = PodState::new(ADDRESS, LOT, TID, "2.7.0".into(), "2.7.0".into(), Utc::now());
    (PodSession::new(state, transport), sent)
}

fn first_nonce(message: &Message) -> u32 {
    message
        .blocks
        .iter()
        .find_map(MessageBlock::nonce)
        .expect("message has no nonce-bearing block")
}

#[test]
fn test_bad_nonce_resync_round_trip() {
    let (mut session, sent) = make_session(vec![
        Reply::Blocks(vec![MessageBlock::ErrorResponse(
            crate::protocol::ErrorResponse::BadNonce { sync_word: 0x3a5c },
        )]),
        status_reply(DeliveryStatus::new(true, false, true)),
    ]);

    let result = session.bolus(Units::new(1.0), false, Duration::zero());
    assert!(matches!(result, DeliveryCommandResult::Success { .. }));

    let sent = sent.borrow();
    assert_eq!(sent.len(), 2);

    // Mirror the generator: advance before the first construction, then
    // reseed from the sync word exactly as the session must have.
    let mut replica = NonceState::new(LOT, TID);
    replica.advance_to_next();
    let expected_first = replica.current();
    assert_eq!(first_nonce(&sent[0]), expected_first);

    replica.resync(0x3a5c, expected_first, sent[0].sequence_num);
    let expected_second = replica.current();
    assert_eq!(first_nonce(&sent[1]), expected_second);
    assert_ne!(expected_first, expected_second);

    // And the session consumed the rewritten nonce afterwards.
    replica.advance_to_next();
    assert_eq!(session.state().nonce_state, replica);
}

#[test]
fn test_nonce_resync_exhaustion_is_certain_failure() {
    let bad_nonce = || {
        Reply::Blocks(vec![MessageBlock::ErrorResponse(
            crate::protocol::ErrorResponse::BadNonce { sync_word: 0x0102 },
        )])
    };
    let (mut session, sent) = make_session(vec![bad_nonce(), bad_nonce()]);

    let result = session.bolus(Units::new(1.0), false, Duration::zero());
    match result {
        DeliveryCommandResult::CertainFailure { error } => {
            assert!(matches!(error, PodCommsError::NonceResyncFailed));
        },
        other => panic!("expected certain failure, got {other:?}"),
    }
    assert_eq!(sent.borrow().len(), 2);
    assert!(session.state().doses.unfinalized_bolus.is_none());
}

#[test]
fn test_uncertain_bolus_reconciled_to_success() {
    let (mut session, sent) = make_session(vec![
        Reply::Error(TransportError::NoResponse),
        status_reply(DeliveryStatus::new(true, false, true)),
    ]);

    let before = Utc::now();
    let result = session.bolus(Units::new(1.5), false, Duration::zero());
    assert!(matches!(result, DeliveryCommandResult::Success { .. }));

    // Command, then verification poll.
    assert_eq!(sent.borrow().len(), 2);

    let bolus = session.state().doses.unfinalized_bolus.expect("bolus recorded");
    assert_eq!(bolus.certainty, ScheduledCertainty::Certain);
    // Start is backdated by the comms offset: before "now".
    assert!(bolus.start_time < Utc::now());
    assert!(bolus.start_time > before - Duration::seconds(5));
    assert_eq!(bolus.units, Some(Units::new(1.5)));
}

#[test]
fn test_uncertain_bolus_reconciled_to_failure() {
    let (mut session, _sent) = make_session(vec![
        Reply::Error(TransportError::NoResponse),
        status_reply(DeliveryStatus::BASAL),
    ]);

    let result = session.bolus(Units::new(1.5), false, Duration::zero());
    match result {
        DeliveryCommandResult::CertainFailure { error } => {
            assert!(matches!(
                error,
                PodCommsError::CommsError(TransportError::NoResponse)
            ));
        },
        other => panic!("expected certain failure, got {other:?}"),
    }
    assert!(session.state().doses.unfinalized_bolus.is_none());
}

#[test]
fn test_unverifiable_bolus_stays_uncertain() {
    let (mut session, _sent) = make_session(vec![
        Reply::Error(TransportError::NoResponse),
        Reply::Error(TransportError::NoResponse),
    ]);

    let result = session.bolus(Units::new(2.0), false, Duration::zero());
    assert!(matches!(result, DeliveryCommandResult::UncertainFailure { .. }));

    let bolus = session.state().doses.unfinalized_bolus.expect("bolus recorded");
    assert_eq!(bolus.certainty, ScheduledCertainty::Uncertain);
}

#[test]
fn test_bolus_empty_response_is_certain_failure() {
    // A reply with no blocks is a protocol anomaly, not a transport
    // failure: no verification poll, no ledger record.
    let (mut session, sent) = make_session(vec![Reply::Blocks(vec![])]);

    let result = session.bolus(Units::new(1.0), false, Duration::zero());
    match result {
        DeliveryCommandResult::CertainFailure { error } => {
            assert!(matches!(error, PodCommsError::EmptyResponse));
        },
        other => panic!("expected certain failure, got {other:?}"),
    }
    assert_eq!(sent.borrow().len(), 1);
    assert!(session.state().doses.unfinalized_bolus.is_none());
}

#[test]
fn test_bolus_crosstalk_is_certain_failure() {
    let (mut session, sent) = make_session(vec![Reply::Addressed(
        0x7777_7777,
        vec![MessageBlock::StatusResponse(base_status(
            DeliveryStatus::new(true, false, true),
        ))],
    )]);

    let result = session.bolus(Units::new(1.0), false, Duration::zero());
    match result {
        DeliveryCommandResult::CertainFailure { error } => {
            assert!(matches!(error, PodCommsError::InvalidAddress { .. }));
        },
        other => panic!("expected certain failure, got {other:?}"),
    }
    assert_eq!(sent.borrow().len(), 1);
    assert!(session.state().doses.unfinalized_bolus.is_none());
}

#[test]
fn test_temp_basal_unexpected_response_is_certain_failure() {
    // An unexpected (non-faulted) block in place of the status reply.
    let (mut session, _sent) = make_session(vec![Reply::Blocks(vec![
        MessageBlock::PodInfoResponse(PodInfoResponse {
            info_type: PodInfoType::PulseLogRecent,
            info: PodInfo::PulseLog(PulseLog { entries: vec![] }),
        }),
    ])]);

    let result = session.set_temp_basal(Units::new(0.5), Duration::minutes(30), false);
    match result {
        DeliveryCommandResult::CertainFailure { error } => {
            assert!(matches!(
                error,
                PodCommsError::UnexpectedResponse(MessageBlockType::PodInfoResponse)
            ));
        },
        other => panic!("expected certain failure, got {other:?}"),
    }
    assert!(session.state().doses.unfinalized_temp_basal.is_none());
}

#[test]
fn test_bolus_guard_rejects_second_bolus() {
    let (mut session, sent) = make_session(vec![
        status_reply(DeliveryStatus::new(true, false, true)),
    ]);
    let result = session.bolus(Units::new(1.0), false, Duration::zero());
    assert!(matches!(result, DeliveryCommandResult::Success { .. }));

    let result = session.bolus(Units::new(1.0), false, Duration::zero());
    match result {
        DeliveryCommandResult::CertainFailure { error } => {
            assert!(matches!(error, PodCommsError::UnfinalizedBolus));
        },
        other => panic!("expected certain failure, got {other:?}"),
    }
    // The guard fired before any message went out.
    assert_eq!(sent.borrow().len(), 1);
}

#[test]
fn test_cancel_all_with_beep_uses_two_commands() {
    let (mut session, sent) = make_session(vec![status_reply(DeliveryStatus::SUSPENDED)]);

    let result = session.cancel_delivery(DeliveryType::ALL, BeepType::BipBip);
    assert!(matches!(result, CancelDeliveryResult::Success { .. }));

    let sent = sent.borrow();
    assert_eq!(sent[0].blocks.len(), 2);
    match (&sent[0].blocks[0], &sent[0].blocks[1]) {
        (
            MessageBlock::CancelDelivery(first),
            MessageBlock::CancelDelivery(second),
        ) => {
            assert_eq!(first.delivery_type, DeliveryType::ALL_BUT_BASAL);
            assert_eq!(first.beep_type, BeepType::NoBeep);
            assert_eq!(second.delivery_type, DeliveryType::BASAL);
            assert_eq!(second.beep_type, BeepType::BipBip);
            // One nonce per message, shared by both blocks.
            assert_eq!(first.nonce, second.nonce);
        },
        other => panic!("expected two cancel blocks, got {other:?}"),
    }

    assert!(session.state().is_suspended());
    assert!(session.state().doses.unfinalized_suspend.is_some());
}

#[test]
fn test_cancel_without_beep_uses_one_command() {
    let (mut session, sent) = make_session(vec![status_reply(DeliveryStatus::SUSPENDED)]);
    let result = session.cancel_delivery(DeliveryType::ALL, BeepType::NoBeep);
    assert!(matches!(result, CancelDeliveryResult::Success { .. }));
    assert_eq!(sent.borrow()[0].blocks.len(), 1);
}

#[test]
fn test_cancel_bolus_records_pod_reported_remainder() {
    let (mut session, _sent) = make_session(vec![
        status_reply(DeliveryStatus::new(true, false, true)),
        {
            let mut status = base_status(DeliveryStatus::BASAL);
            status.bolus_not_delivered = Units::new(0.6);
            Reply::Blocks(vec![MessageBlock::StatusResponse(status)])
        },
    ]);

    let result = session.bolus(Units::new(2.0), false, Duration::zero());
    assert!(matches!(result, DeliveryCommandResult::Success { .. }));

    let result = session.cancel_delivery(DeliveryType::BOLUS, BeepType::NoBeep);
    assert!(matches!(result, CancelDeliveryResult::Success { .. }));

    let cancelled = session
        .state()
        .doses
        .finalized_doses
        .iter()
        .find(|dose| dose.kind == DoseKind::Bolus)
        .expect("cancelled bolus finalized");
    assert_eq!(cancelled.units_not_delivered, Some(Units::new(0.6)));
    assert!(session.state().doses.unfinalized_bolus.is_none());
}

#[test]
fn test_fault_captures_dose_state_once() {
    let (mut session, _sent) = make_session(vec![
        status_reply(DeliveryStatus::new(true, false, true)),
        fault_reply(Units::new(0.4), FaultEventCode::OCCLUSION),
        fault_reply(Units::new(0.1), FaultEventCode::RESERVOIR_EMPTY),
    ]);

    let result = session.bolus(Units::new(1.0), false, Duration::zero());
    assert!(matches!(result, DeliveryCommandResult::Success { .. }));

    // The fault arrives in place of a status response.
    let error = session.get_status().unwrap_err();
    assert!(matches!(error, PodCommsError::PodFault(_)));

    let state = session.state();
    assert!(state.is_faulted());
    assert!(state.doses.unfinalized_bolus.is_none());
    let bolus = state
        .doses
        .finalized_doses
        .iter()
        .find(|dose| dose.kind == DoseKind::Bolus)
        .expect("interrupted bolus finalized");
    assert_eq!(bolus.units_not_delivered, Some(Units::new(0.4)));
    assert_eq!(
        state.fault.unwrap().status.fault_event_code,
        FaultEventCode::OCCLUSION
    );

    // A later fault-bearing response does not alter the first capture.
    let error = session.get_status().unwrap_err();
    assert!(matches!(error, PodCommsError::PodFault(_)));
    assert_eq!(
        session.state().fault.unwrap().status.fault_event_code,
        FaultEventCode::OCCLUSION
    );
}

#[test]
fn test_activation_timeout_fault_is_discriminated() {
    let mut detailed = faulted_detailed(Units::default(), FaultEventCode::NONE);
    detailed.pod_progress = PodProgressStatus::ActivationTimeExceeded;
    let (mut session, _sent) = make_session(vec![Reply::Blocks(vec![
        MessageBlock::PodInfoResponse(PodInfoResponse {
            info_type: PodInfoType::DetailedStatus,
            info: PodInfo::DetailedStatus(detailed),
        }),
    ])]);

    let error = session.get_status().unwrap_err();
    assert!(matches!(error, PodCommsError::ActivationTimeExceeded));
    assert!(session.state().is_faulted());
}

#[test]
fn test_crosstalk_response_never_mutates_state() {
    let (mut session, _sent) = make_session(vec![Reply::Addressed(
        0x7777_7777,
        vec![MessageBlock::StatusResponse(base_status(
            DeliveryStatus::BASAL,
        ))],
    )]);
    let before = session.state().clone();

    let error = session.get_status().unwrap_err();
    match error {
        PodCommsError::InvalidAddress { got, expected } => {
            assert_eq!(got, 0x7777_7777);
            assert_eq!(expected, ADDRESS);
        },
        other => panic!("expected invalid address, got {other:?}"),
    }
    assert_eq!(session.state(), &before);
}

#[test]
fn test_rejected_message_is_certain_failure() {
    let (mut session, _sent) = make_session(vec![Reply::Blocks(vec![
        MessageBlock::ErrorResponse(crate::protocol::ErrorResponse::NonRetryable {
            code: 0x07,
            fault_event_code: FaultEventCode::NONE,
            pod_progress: PodProgressStatus::AboveFiftyUnits,
        }),
    ])]);

    let result = session.set_temp_basal(Units::new(0.8), Duration::minutes(30), false);
    match result {
        DeliveryCommandResult::CertainFailure { error } => {
            assert!(matches!(error, PodCommsError::RejectedMessage(0x07)));
        },
        other => panic!("expected certain failure, got {other:?}"),
    }
    assert!(session.state().doses.unfinalized_temp_basal.is_none());
}

#[test]
fn test_temp_basal_uncertain_on_transport_failure() {
    let (mut session, sent) =
        make_session(vec![Reply::Error(TransportError::NoResponse)]);

    let result = session.set_temp_basal(Units::new(0.8), Duration::minutes(30), false);
    assert!(matches!(result, DeliveryCommandResult::UncertainFailure { .. }));
    // No verification poll for temp basals.
    assert_eq!(sent.borrow().len(), 1);
    let temp_basal = session
        .state()
        .doses
        .unfinalized_temp_basal
        .expect("uncertain temp basal recorded");
    assert_eq!(temp_basal.certainty, ScheduledCertainty::Uncertain);
    assert_eq!(temp_basal.rate, Some(Units::new(0.8)));
}

#[test]
fn test_set_basal_schedule_records_resume() {
    let (mut session, _sent) = make_session(vec![status_reply(DeliveryStatus::BASAL)]);
    let schedule = crate::basal::BasalSchedule::single_rate(Units::new(1.0));

    session
        .set_basal_schedule(&schedule, Duration::hours(9), false)
        .unwrap();
    assert!(!session.state().is_suspended());
    assert!(session.state().doses.unfinalized_resume.is_some());
}

#[test]
fn test_set_basal_schedule_uncertain_resume_on_transport_failure() {
    let (mut session, _sent) =
        make_session(vec![Reply::Error(TransportError::NoResponse)]);
    let schedule = crate::basal::BasalSchedule::single_rate(Units::new(1.0));

    let error = session
        .set_basal_schedule(&schedule, Duration::zero(), false)
        .unwrap_err();
    assert!(matches!(error, PodCommsError::CommsError(_)));
    let resume = session
        .state()
        .doses
        .unfinalized_resume
        .expect("uncertain resume recorded");
    assert_eq!(resume.certainty, ScheduledCertainty::Uncertain);
}

#[test]
fn test_suspend_then_resume_finalizes_pair() {
    let (mut session, _sent) = make_session(vec![
        status_reply(DeliveryStatus::SUSPENDED),
        status_reply(DeliveryStatus::BASAL),
    ]);
    let schedule = crate::basal::BasalSchedule::single_rate(Units::new(1.0));

    let result = session.cancel_delivery(DeliveryType::ALL, BeepType::NoBeep);
    assert!(matches!(result, CancelDeliveryResult::Success { .. }));
    assert!(session.state().is_suspended());

    session
        .set_basal_schedule(&schedule, Duration::zero(), false)
        .unwrap();

    let state = session.state();
    assert!(state.doses.unfinalized_suspend.is_none());
    assert!(state.doses.unfinalized_resume.is_none());
    let kinds: Vec<_> = state
        .doses
        .finalized_doses
        .iter()
        .map(|dose| dose.kind)
        .collect();
    assert_eq!(kinds, vec![DoseKind::Suspend, DoseKind::Resume]);
}

#[test]
fn test_transport_state_persisted_after_exchange() {
    let (mut session, _sent) = make_session(vec![status_reply(DeliveryStatus::BASAL)]);
    assert_eq!(session.state().message_transport_state, MessageTransportState::default());
    session.get_status().unwrap();
    assert_eq!(session.state().message_transport_state.message_number, 2);
}

#[test]
fn test_delegate_notified_on_mutation() {
    #[derive(Default)]
    struct CountingDelegate {
        notifications: RefCell<usize>,
    }
    impl PodSessionDelegate for CountingDelegate {
        fn pod_state_did_change(&self, _state: &PodState) {
            *self.notifications.borrow_mut() += 1;
        }
    }

    let (mut session, _sent) = make_session(vec![status_reply(DeliveryStatus::BASAL)]);
    let delegate = Rc::new(CountingDelegate::default());
    let handle: Rc<dyn PodSessionDelegate> = delegate.clone();
    session.set_delegate(Rc::downgrade(&handle));

    session.get_status().unwrap();
    assert!(*delegate.notifications.borrow() >= 1);

    // Dropping the strong reference must silently detach the observer.
    drop(handle);
    drop(delegate);
    let _ = session.get_status();
}

#[test]
fn test_acknowledge_alerts_returns_still_active() {
    let mut status = base_status(DeliveryStatus::BASAL);
    status.active_alerts = AlertSet::from_raw(0b1000_0000);
    let (mut session, _sent) =
        make_session(vec![Reply::Blocks(vec![MessageBlock::StatusResponse(status)])]);

    let configured = crate::alerts::PodAlert::finish_setup_reminder();
    session.mutate(|state| state.record_configured_alerts(&[configured]));

    let mut acked = AlertSet::EMPTY;
    acked.insert(crate::alerts::AlertSlot::Slot7);
    let still_active = session.acknowledge_alerts(acked).unwrap();
    assert_eq!(still_active.len(), 1);
    assert!(still_active.contains_key(&crate::alerts::AlertSlot::Slot7));
}

#[test]
fn test_deactivate_faulted_pod_reads_pulse_log_and_tolerates_fault() {
    let (mut session, sent) = make_session(vec![
        fault_reply(Units::default(), FaultEventCode::OCCLUSION),
        Reply::Blocks(vec![MessageBlock::PodInfoResponse(PodInfoResponse {
            info_type: PodInfoType::PulseLogRecent,
            info: PodInfo::PulseLog(PulseLog {
                entries: vec![0x0102_0304],
            }),
        })]),
        fault_reply(Units::default(), FaultEventCode::OCCLUSION),
    ]);

    // Latch the fault first.
    let _ = session.get_status().unwrap_err();
    assert!(session.state().is_faulted());

    // Deactivation reads the pulse log, then tolerates the pod faulting
    // again during the deactivate command itself.
    session.deactivate_pod().unwrap();

    let sent = sent.borrow();
    assert_eq!(sent.len(), 3);
    assert!(matches!(
        sent[1].blocks[0],
        MessageBlock::GetStatus(ref command)
            if command.pod_info_type == PodInfoType::PulseLogRecent
    ));
    assert_eq!(
        sent[2].blocks[0].block_type(),
        MessageBlockType::DeactivatePod
    );
}

#[test]
fn test_deactivate_propagates_activation_timeout() {
    let mut detailed = faulted_detailed(Units::default(), FaultEventCode::NONE);
    detailed.pod_progress = PodProgressStatus::ActivationTimeExceeded;
    let (mut session, _sent) = make_session(vec![Reply::Blocks(vec![
        MessageBlock::PodInfoResponse(PodInfoResponse {
            info_type: PodInfoType::DetailedStatus,
            info: PodInfo::DetailedStatus(detailed),
        }),
    ])]);

    // Unlike an ordinary fault, the activation window lapsing surfaces.
    let error = session.deactivate_pod().unwrap_err();
    assert!(matches!(error, PodCommsError::ActivationTimeExceeded));
    assert!(session.state().is_faulted());
}

#[test]
fn test_sequence_numbers_monotonic() {
    let (mut session, sent) = make_session(vec![
        status_reply(DeliveryStatus::BASAL),
        status_reply(DeliveryStatus::BASAL),
        status_reply(DeliveryStatus::BASAL),
    ]);
    session.get_status().unwrap();
    session.get_status().unwrap();
    session.get_status().unwrap();

    let sent = sent.borrow();
    let seqs: Vec<_> = sent.iter().map(|message| message.sequence_num).collect();
    assert_eq!(seqs, vec![0, 2, 4]);
}

mod setup {
    use super::*;

    #[test]
    fn test_prime_full_sequence() {
        let (mut session, sent) = make_session(vec![
            progress_reply(PodProgressStatus::PairingCompleted),
            progress_reply(PodProgressStatus::PairingCompleted),
            progress_reply(PodProgressStatus::Priming),
        ]);

        let wait = session.prime().unwrap();
        assert_eq!(wait, Duration::seconds(55));
        assert_eq!(session.state().setup_progress, SetupProgress::Priming);
        assert!(session.state().prime_finish_time.is_some());

        let sent = sent.borrow();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0].blocks[0].block_type(), MessageBlockType::FaultConfig);
        assert!(sent[0].expect_follow_on);
        assert_eq!(
            sent[1].blocks[0].block_type(),
            MessageBlockType::ConfigureAlerts
        );
        assert_eq!(
            sent[2].blocks[0].block_type(),
            MessageBlockType::SetInsulinSchedule
        );
        match &sent[2].blocks[0] {
            MessageBlock::SetInsulinSchedule(command) => {
                assert_eq!(
                    command.schedule,
                    InsulinSchedule::Bolus {
                        pulses: 52,
                        seconds_per_pulse: 1
                    }
                );
            },
            other => panic!("expected insulin schedule, got {other:?}"),
        }
        assert_eq!(sent[2].blocks[1].block_type(), MessageBlockType::BolusExtra);
    }

    #[test]
    fn test_prime_recovers_lost_confirmation() {
        let (mut session, sent) =
            make_session(vec![progress_reply(PodProgressStatus::Priming)]);
        session.mutate(|state| {
            state.advance_setup_progress(SetupProgress::StartingPrime);
            state.prime_finish_time = Some(Utc::now() + Duration::seconds(30));
        });

        let wait = session.prime().unwrap();
        assert!(wait <= Duration::seconds(30));
        assert_eq!(session.state().setup_progress, SetupProgress::Priming);

        // Only the status poll went out; the prime command was not reissued.
        let sent = sent.borrow();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].blocks[0].block_type(), MessageBlockType::GetStatus);
    }

    #[test]
    fn test_program_initial_basal_schedule_skips_when_pod_confirmed() {
        let (mut session, sent) =
            make_session(vec![progress_reply(PodProgressStatus::BasalInitialized)]);
        session.mutate(|state| {
            state.advance_setup_progress(SetupProgress::SettingInitialBasalSchedule);
        });

        let schedule = crate::basal::BasalSchedule::single_rate(Units::new(0.5));
        session
            .program_initial_basal_schedule(&schedule, Duration::zero())
            .unwrap();
        assert_eq!(
            session.state().setup_progress,
            SetupProgress::InitialBasalScheduleSet
        );
        assert_eq!(sent.borrow().len(), 1);
    }

    #[test]
    fn test_insert_cannula_requires_activation() {
        let (mut session, _sent) = make_session(vec![]);
        let error = session.insert_cannula().unwrap_err();
        assert!(matches!(error, PodCommsError::NoPodPaired));
    }

    #[test]
    fn test_insert_cannula_configures_alarms_then_boluses() {
        let (mut session, sent) = make_session(vec![
            progress_reply(PodProgressStatus::BasalInitialized),
            progress_reply(PodProgressStatus::InsertingCannula),
        ]);
        session.mutate(|state| {
            state.activated_at = Some(Utc::now() - Duration::minutes(5));
            state.advance_setup_progress(SetupProgress::InitialBasalScheduleSet);
        });

        let wait = session.insert_cannula().unwrap();
        assert_eq!(wait, Duration::seconds(10));
        assert_eq!(
            session.state().setup_progress,
            SetupProgress::CannulaInserting
        );

        let sent = sent.borrow();
        assert_eq!(sent.len(), 2);
        assert_eq!(
            sent[0].blocks[0].block_type(),
            MessageBlockType::ConfigureAlerts
        );
        match &sent[1].blocks[0] {
            MessageBlock::SetInsulinSchedule(command) => {
                assert_eq!(
                    command.schedule,
                    InsulinSchedule::Bolus {
                        pulses: 10,
                        seconds_per_pulse: 1
                    }
                );
            },
            other => panic!("expected insulin schedule, got {other:?}"),
        }
    }

    #[test]
    fn test_insert_cannula_detects_completion_on_reissue() {
        let (mut session, sent) =
            make_session(vec![progress_reply(PodProgressStatus::AboveFiftyUnits)]);
        session.mutate(|state| {
            state.activated_at = Some(Utc::now() - Duration::minutes(10));
            state.advance_setup_progress(SetupProgress::CannulaInserting);
        });

        let wait = session.insert_cannula().unwrap();
        assert_eq!(wait, Duration::zero());
        assert_eq!(session.state().setup_progress, SetupProgress::Completed);
        assert_eq!(sent.borrow().len(), 1);
    }

    #[test]
    fn test_check_insertion_completed_stashes_baseline() {
        let (mut session, _sent) =
            make_session(vec![progress_reply(PodProgressStatus::AboveFiftyUnits)]);
        session.mutate(|state| {
            state.advance_setup_progress(SetupProgress::CannulaInserting);
        });

        assert!(session.check_insertion_completed().unwrap());
        let state = session.state();
        assert!(state.setup_progress.is_complete());
        assert_eq!(state.setup_units_delivered, Some(Units::from_pulses(100)));
    }

    #[test]
    fn test_check_insertion_not_completed() {
        let (mut session, _sent) =
            make_session(vec![progress_reply(PodProgressStatus::InsertingCannula)]);
        assert!(!session.check_insertion_completed().unwrap());
    }
}
