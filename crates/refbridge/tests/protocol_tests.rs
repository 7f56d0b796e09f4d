//! Tests for protocol version negotiation.

use pretty_assertions::assert_eq;
use refbridge::{
    BridgeError, ErrorKind, LEGACY_PROTOCOL_VERSION, MIN_SUPPORTED_VERSION, PROTOCOL_VERSION, VersionPair, negotiate,
};

#[test]
fn matching_pairs_agree() {
    let local = VersionPair::local();
    assert_eq!(negotiate(Some(VersionPair::new(1, 1)), local, false), Ok(1));
    assert_eq!((PROTOCOL_VERSION, MIN_SUPPORTED_VERSION), (1, 1));
}

#[test]
fn newer_caller_settles_on_local_version() {
    let local = VersionPair::new(2, 1);
    assert_eq!(negotiate(Some(VersionPair::new(3, 2)), local, false), Ok(2));
    assert_eq!(negotiate(Some(VersionPair::new(1, 1)), local, false), Ok(1));
}

#[test]
fn caller_too_old_is_rejected_with_both_pairs() {
    let local = VersionPair::local();
    let caller = VersionPair::new(0, 0);
    let err = negotiate(Some(caller), local, false).unwrap_err();
    assert_eq!(
        err,
        BridgeError::ProtocolVersionMismatch {
            caller: Some(caller),
            local,
        }
    );
    assert_eq!(err.kind(), ErrorKind::ProtocolVersionMismatch);
    assert!(!err.is_recoverable());
    assert_eq!(
        err.to_string(),
        "protocol version mismatch: caller (protocol=0, min=0), local (protocol=1, min=1)"
    );
}

#[test]
fn caller_requiring_newer_local_is_rejected() {
    let err = negotiate(Some(VersionPair::new(5, 4)), VersionPair::local(), false).unwrap_err();
    assert!(matches!(err, BridgeError::ProtocolVersionMismatch { .. }));
}

#[test]
fn legacy_caller_needs_explicit_opt_in() {
    let local = VersionPair::local();
    assert_eq!(negotiate(Some(VersionPair::legacy()), local, true), Ok(LEGACY_PROTOCOL_VERSION));
    assert!(negotiate(Some(VersionPair::legacy()), local, false).is_err());
}

#[test]
fn missing_pair() {
    let local = VersionPair::local();
    let err = negotiate(None, local, false).unwrap_err();
    assert_eq!(err, BridgeError::ProtocolVersionMismatch { caller: None, local });
    assert!(err.to_string().contains("(unspecified)"));

    assert_eq!(negotiate(None, local, true), Ok(LEGACY_PROTOCOL_VERSION));
}

#[test]
fn legacy_mode_still_rejects_callers_from_the_future() {
    let err = negotiate(Some(VersionPair::new(9, 9)), VersionPair::local(), true).unwrap_err();
    assert!(matches!(
        err,
        BridgeError::ProtocolVersionMismatch { caller: Some(pair), .. } if pair == VersionPair::new(9, 9)
    ));
}

#[test]
fn pair_from_envelope_fields() {
    assert_eq!(VersionPair::from_fields(Some(1), Some(1)), Some(VersionPair::new(1, 1)));
    assert_eq!(VersionPair::from_fields(Some(1), None), None);
    assert_eq!(VersionPair::from_fields(None, None), None);
    assert_eq!(VersionPair::default(), VersionPair::local());
}
