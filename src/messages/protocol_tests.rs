use super::*;

#[test]
fn classifies_transaction_verbs() {
    assert_eq!(classify_verb("begin"), Some(Verb::Begin));
    assert_eq!(classify_verb("  BEGIN; select 1"), Some(Verb::Begin));
    assert_eq!(classify_verb("START TRANSACTION"), Some(Verb::Begin));
    assert_eq!(classify_verb("commit"), Some(Verb::Commit));
    assert_eq!(classify_verb("END"), Some(Verb::Commit));
    assert_eq!(classify_verb("rollback"), Some(Verb::Rollback));
    assert_eq!(classify_verb("ABORT"), Some(Verb::Rollback));
    assert_eq!(classify_verb("select 1"), None);
    assert_eq!(classify_verb(""), None);
}

#[test]
fn parses_ssl_request() {
    let frame = encode_ssl_request();
    let (msg, consumed) = try_parse_initial_message(&frame).unwrap().unwrap();
    assert_eq!(consumed, 8);
    assert!(matches!(msg, InitialMessage::SslRequest));
}

#[test]
fn parses_startup_with_user_and_database() {
    let frame = encode_startup(&[("user", "alice"), ("database", "app")]);
    let (msg, consumed) = try_parse_initial_message(&frame).unwrap().unwrap();
    assert_eq!(consumed, frame.len());
    match msg {
        InitialMessage::Startup { params } => {
            assert_eq!(params.get("user").map(String::as_str), Some("alice"));
            assert_eq!(params.get("database").map(String::as_str), Some("app"));
        }
        _ => panic!("expected startup"),
    }
}

#[test]
fn startup_missing_user_is_rejected() {
    let frame = encode_startup(&[("database", "app")]);
    let err = try_parse_initial_message(&frame).unwrap_err();
    assert!(matches!(err, ProtocolError::MissingStartupParam("user")));
}

#[test]
fn initial_message_waits_for_more_bytes() {
    let frame = encode_startup(&[("user", "alice"), ("database", "app")]);
    assert!(try_parse_initial_message(&frame[..frame.len() - 1])
        .unwrap()
        .is_none());
}

#[test]
fn frame_too_short_waits() {
    let full = encode_ready_for_query(TransactionStatus::Idle);
    let (messages, consumed) = parse_server_messages(&full[..full.len() - 1]).unwrap();
    assert!(messages.is_empty());
    assert_eq!(consumed, 0);
}

#[test]
fn rejects_oversized_frame_length() {
    let mut buf = BytesMut::new();
    buf.put_u8(b'Q');
    buf.put_i32(MAX_MESSAGE_SIZE + 1);
    let err = parse_client_messages(&buf).unwrap_err();
    assert!(matches!(err, ProtocolError::FrameTooLarge(_, _)));
}

#[test]
fn round_trips_ready_for_query() {
    for status in [
        TransactionStatus::Idle,
        TransactionStatus::InTransaction,
        TransactionStatus::Failed,
    ] {
        let frame = encode_ready_for_query(status);
        let (messages, consumed) = parse_server_messages(&frame).unwrap();
        assert_eq!(consumed, frame.len());
        match messages.as_slice() {
            [ServerMessage::ReadyForQuery { status: got }] => assert_eq!(*got, status),
            other => panic!("unexpected parse result: {other:?}"),
        }
    }
}

#[test]
fn round_trips_command_complete() {
    let frame = encode_command_complete("COMMIT");
    let (messages, consumed) = parse_server_messages(&frame).unwrap();
    assert_eq!(consumed, frame.len());
    match messages.as_slice() {
        [ServerMessage::CommandComplete { tag }] => assert_eq!(tag, "COMMIT"),
        other => panic!("unexpected parse result: {other:?}"),
    }
}

#[test]
fn round_trips_query() {
    let frame = encode_query("select 1");
    let (messages, consumed) = parse_client_messages(&frame).unwrap();
    assert_eq!(consumed, frame.len());
    match messages.as_slice() {
        [ClientMessage::Query { sql }] => assert_eq!(sql, "select 1"),
        other => panic!("unexpected parse result: {other:?}"),
    }
}

#[test]
fn parses_authentication_ok() {
    let frame = encode_authentication_ok();
    let (messages, consumed) = parse_server_messages(&frame).unwrap();
    assert_eq!(consumed, frame.len());
    assert!(matches!(messages.as_slice(), [ServerMessage::AuthenticationOk]));
}

#[test]
fn extracts_error_message_field() {
    let frame = encode_error_response("connection refused");
    let (messages, _) = parse_server_messages(&frame).unwrap();
    match messages.as_slice() {
        [ServerMessage::ErrorResponse { message }] => {
            assert_eq!(message, "connection refused");
        }
        other => panic!("unexpected parse result: {other:?}"),
    }
}

#[test]
fn parses_multiple_frames_in_one_buffer() {
    let mut buf = BytesMut::new();
    buf.put(encode_ready_for_query(TransactionStatus::Idle));
    buf.put(encode_command_complete("BEGIN"));
    let (messages, consumed) = parse_server_messages(&buf).unwrap();
    assert_eq!(consumed, buf.len());
    assert_eq!(messages.len(), 2);
}

#[test]
fn leaves_partial_trailing_frame_unconsumed() {
    let mut buf = BytesMut::new();
    buf.put(encode_command_complete("COMMIT"));
    let full_len = buf.len();
    buf.put(&encode_ready_for_query(TransactionStatus::Idle)[..3]);
    let (messages, consumed) = parse_server_messages(&buf).unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(consumed, full_len);
}
