use crate::{
    case_result::{CaseResult, ExeStatus},
    channel::{Channel, Timeout},
    error::{NetworkError, ProtocolError, WireError},
    msg::Msg,
};
use std::{
    net::{TcpListener, TcpStream},
    time::{Duration, Instant},
};

fn pair(default_timeout: Duration) -> (Channel<TcpStream>, Channel<TcpStream>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).unwrap();
    let (server, _) = listener.accept().unwrap();
    (
        Channel::new(client, default_timeout),
        Channel::new(server, default_timeout),
    )
}

fn pair_2s() -> (Channel<TcpStream>, Channel<TcpStream>) {
    pair(Duration::from_secs(2))
}

#[test]
fn u32_round_trip() {
    let (mut a, mut b) = pair_2s();
    for &x in &[0u32, 1, 7, 0x1234_5678, u32::max_value()] {
        a.write_u32(x, Timeout::Default).unwrap();
        assert_eq!(b.read_u32(Timeout::Default).unwrap(), x);
    }
}

#[test]
fn i32_round_trip() {
    let (mut a, mut b) = pair_2s();
    for &x in &[0i32, -1, 1, i32::min_value(), i32::max_value()] {
        a.write_i32(x, Timeout::Default).unwrap();
        assert_eq!(b.read_i32(Timeout::Default).unwrap(), x);
    }
}

#[test]
fn string_round_trip() {
    let cases: Vec<Vec<u8>> = vec![
        b"".to_vec(),
        b"hello".to_vec(),
        b"with\0embedded\0nuls".to_vec(),
        vec![0xAB; 70_000], // crosses typical socket buffer sizes
    ];
    for data in cases {
        let (mut a, mut b) = pair_2s();
        let expected = data.clone();
        // a concurrent writer lets payloads larger than the loopback socket
        // buffer drain
        let writer = std::thread::spawn(move || {
            a.write_string(&data, Timeout::Default).unwrap();
        });
        let got = b.read_string(Timeout::Default).unwrap();
        writer.join().unwrap();
        assert_eq!(got, expected);
    }
}

#[test]
fn read_times_out_on_silence() {
    let (mut a, _b) = pair_2s();
    let start = Instant::now();
    let err = a
        .read_u32(Timeout::After(Duration::from_millis(100)))
        .unwrap_err();
    assert!(matches!(err, NetworkError::Timeout { .. }));
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[test]
fn keepalive_is_transparent() {
    let (mut a, mut b) = pair_2s();
    b.send_msg(Msg::TellOnline, Timeout::Default).unwrap();
    b.send_msg(Msg::TellOnline, Timeout::Default).unwrap();
    b.send_msg(Msg::DataOk, Timeout::Default).unwrap();
    a.expect_msg(Msg::DataOk, Timeout::Default).unwrap();
}

#[test]
fn keepalive_does_not_extend_deadline() {
    let (mut a, mut b) = pair_2s();
    let waiter = std::thread::spawn(move || {
        let start = Instant::now();
        let res = a.expect_msg(Msg::DataOk, Timeout::After(Duration::from_millis(300)));
        (res, start.elapsed())
    });
    std::thread::sleep(Duration::from_millis(100));
    b.send_msg(Msg::TellOnline, Timeout::Default).unwrap();
    // then silence: the wait must still end near its original deadline
    let (res, elapsed) = waiter.join().unwrap();
    match res.unwrap_err() {
        WireError::Network(NetworkError::Timeout { .. }) => {}
        other => panic!("expected timeout, got {:?}", other),
    }
    assert!(elapsed >= Duration::from_millis(250), "ended early: {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(800), "deadline extended: {:?}", elapsed);
}

#[test]
fn unexpected_message_is_protocol_error() {
    let (mut a, mut b) = pair_2s();
    b.send_msg(Msg::CompileFail, Timeout::Default).unwrap();
    let err = a.expect_msg(Msg::DataOk, Timeout::Default).unwrap_err();
    match err {
        WireError::Protocol(ProtocolError::UnexpectedMessage { got, .. }) => {
            assert_eq!(got, Msg::CompileFail.code());
        }
        other => panic!("expected protocol error, got {:?}", other),
    }
}

#[test]
fn unknown_code_is_protocol_error() {
    let (mut a, mut b) = pair_2s();
    a.write_u32(0xDEAD_0000, Timeout::Default).unwrap();
    let err = b.recv_msg(Timeout::Default).unwrap_err();
    match err {
        WireError::Protocol(ProtocolError::UnknownCode(code)) => assert_eq!(code, 0xDEAD_0000),
        other => panic!("expected unknown-code error, got {:?}", other),
    }
}

#[test]
fn case_result_round_trip() {
    let (mut a, mut b) = pair_2s();
    let result = CaseResult {
        status: ExeStatus::PartiallyCorrect,
        score: 40,
        time_us: 1_250_000,
        memory_kb: 65_536,
        extra_info: "2 of 5 lines differ".to_string(),
    };
    result.write_to(&mut a, Timeout::Default).unwrap();
    let got = CaseResult::read_from(&mut b, Timeout::Default).unwrap();
    assert_eq!(got, result);
}

#[test]
fn close_is_idempotent() {
    let (mut a, _b) = pair_2s();
    a.close();
    a.close();
}
