use bytes::BytesMut;
use frankenrouter::core::RouterError;
use frankenrouter::core::message::{LineCodec, MAX_LINE_LENGTH, Message};
use tokio_util::codec::{Decoder, Encoder};

#[test]
fn crlf_terminated_line_is_decoded() {
    let mut codec = LineCodec::new();
    let mut buf = BytesMut::from(&b"Qi123=456\r\n"[..]);
    assert_eq!(codec.decode(&mut buf).unwrap(), Some("Qi123=456".into()));
    assert_eq!(codec.decode(&mut buf).unwrap(), None);
}

#[test]
fn bare_lf_is_accepted_on_ingest() {
    let mut codec = LineCodec::new();
    let mut buf = BytesMut::from(&b"load1\nQs121=hello\r\n"[..]);
    assert_eq!(codec.decode(&mut buf).unwrap(), Some("load1".into()));
    assert_eq!(codec.decode(&mut buf).unwrap(), Some("Qs121=hello".into()));
}

#[test]
fn emission_uses_crlf() {
    let mut codec = LineCodec::new();
    let mut buf = BytesMut::new();
    codec.encode("load1", &mut buf).unwrap();
    assert_eq!(&buf[..], b"load1\r\n");
}

#[test]
fn partial_line_waits_for_more_data() {
    let mut codec = LineCodec::new();
    let mut buf = BytesMut::from(&b"Qs121=hel"[..]);
    assert_eq!(codec.decode(&mut buf).unwrap(), None);
    buf.extend_from_slice(b"lo\r\n");
    assert_eq!(codec.decode(&mut buf).unwrap(), Some("Qs121=hello".into()));
}

#[test]
fn max_length_line_survives_round_trip() {
    // The boundary case: 65,535 bytes of payload.
    let value = "x".repeat(65_535 - 6);
    let line = format!("Qs121={value}");
    assert_eq!(line.len(), 65_535);

    let mut codec = LineCodec::new();
    let mut buf = BytesMut::new();
    codec.encode(line.as_str(), &mut buf).unwrap();
    let decoded = codec.decode(&mut buf).unwrap().unwrap();
    assert_eq!(decoded, line);
}

#[test]
fn overlong_line_is_dropped_and_session_survives() {
    let mut codec = LineCodec::new();
    let big = "y".repeat(MAX_LINE_LENGTH + 10);
    let mut buf = BytesMut::new();
    buf.extend_from_slice(big.as_bytes());
    buf.extend_from_slice(b"\r\nQi1=2\r\n");

    let err = codec.decode(&mut buf).unwrap_err();
    assert!(matches!(err, RouterError::LineTooLong(_)));
    // The next line decodes normally.
    assert_eq!(codec.decode(&mut buf).unwrap(), Some("Qi1=2".into()));
}

#[test]
fn overlong_line_in_pieces_enters_discard_mode() {
    let mut codec = LineCodec::new();
    let mut buf = BytesMut::new();
    // Feed more than the limit without a terminator.
    buf.extend_from_slice("z".repeat(MAX_LINE_LENGTH + 1).as_bytes());
    assert_eq!(codec.decode(&mut buf).unwrap(), None);
    // The tail of the over-long line arrives, then a good line.
    buf.extend_from_slice(b"zzz\r\n");
    let err = codec.decode(&mut buf).unwrap_err();
    assert!(matches!(err, RouterError::LineTooLong(_)));
    buf.extend_from_slice(b"load2\r\n");
    assert_eq!(codec.decode(&mut buf).unwrap(), Some("load2".into()));
}

#[test]
fn partial_line_at_eof_is_discarded() {
    let mut codec = LineCodec::new();
    let mut buf = BytesMut::from(&b"no terminator here"[..]);
    assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
    assert!(buf.is_empty());
}

#[test]
fn whitespace_is_preserved() {
    let mut codec = LineCodec::new();
    let mut buf = BytesMut::from(&b"Qs119=  spacey value  \r\n"[..]);
    let line = codec.decode(&mut buf).unwrap().unwrap();
    let msg = Message::parse(&line);
    assert_eq!(msg.value(), Some("  spacey value  "));
}

#[test]
fn message_parse_variants() {
    assert_eq!(Message::parse("bang"), Message::Signal("bang".into()));
    assert_eq!(
        Message::parse("demand=Qs325"),
        Message::KeyValue {
            key: "demand".into(),
            value: "Qs325".into()
        }
    );
    assert_eq!(Message::parse("Qi1=").value(), Some(""));
}
