/*!
Tests for error handling and error types.
*/

use crate::error::VaultError;
use std::error::Error;
use std::io;

#[test]
fn test_vault_error_display() {
    let error = VaultError::validation("test validation error");
    assert_eq!(error.to_string(), "Validation error: test validation error");

    let error = VaultError::compression("test compression error");
    assert_eq!(error.to_string(), "Compression error: test compression error");

    let error = VaultError::storage("test storage error");
    assert_eq!(error.to_string(), "Storage error: test storage error");

    let error = VaultError::codec(4, "unterminated string");
    assert_eq!(error.to_string(), "Codec error at statement 4: unterminated string");
}

#[test]
fn test_vault_error_from_io_error() {
    let io_error = io::Error::new(io::ErrorKind::NotFound, "File not found");
    let error = VaultError::from(io_error);

    match error {
        VaultError::Io(_) => {}
        _ => panic!("Expected Io error variant"),
    }
}

#[test]
fn test_vault_error_from_json_error() {
    let json_error = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
    let error = VaultError::from(json_error);

    match error {
        VaultError::Json(_) => {}
        _ => panic!("Expected Json error variant"),
    }
}

#[test]
fn test_integrity_check_failed_error() {
    let error = VaultError::IntegrityCheckFailed {
        expected: "abc123".to_string(),
        actual: "def456".to_string(),
    };

    assert!(error.to_string().contains("abc123"));
    assert!(error.to_string().contains("def456"));
}

#[test]
fn test_backup_failed_wraps_once() {
    let error = VaultError::backup_failed(VaultError::storage("disk full"));
    let wrapped_again = VaultError::backup_failed(error);

    match &wrapped_again {
        VaultError::BackupFailed { source } => {
            assert!(matches!(**source, VaultError::Storage(_)))
        }
        other => panic!("Expected BackupFailed, got {other:?}"),
    }
    assert!(wrapped_again.source().is_some());
}

#[test]
fn test_restore_failed_carries_position() {
    let error = VaultError::restore_failed(
        3,
        VaultError::Execution {
            position: 3,
            message: "no such table".to_string(),
        },
    );

    assert!(error.to_string().contains("statement 3"));
    assert!(error.to_string().contains("rolled back"));
    assert_eq!(error.exit_code(), 1);
}

#[test]
fn test_exit_codes() {
    assert_eq!(VaultError::VerificationFailed("missing table".into()).exit_code(), 2);
    assert_eq!(VaultError::not_found("backup x").exit_code(), 1);
    assert!(!VaultError::integrity("bad header").is_verification_only());
}

#[test]
fn test_error_is_send_and_sync() {
    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    assert_send::<VaultError>();
    assert_sync::<VaultError>();
}
