// larynx - SIP signaling for voice-AI agents
// Copyright (C) 2025 The larynx developers
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Manager-level transaction behavior against a recording dispatcher.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use larynx_core::{Headers, Method, Request, RequestLine, Response, SipUri, StatusLine};
use larynx_transaction::{
    ClientTransactionUser, ReceiveOutcome, TerminationKind, TimerDefaults, TransactionKey,
    TransactionManager, TransportContext, TransportDispatcher, TransportKind,
};
use tokio::sync::Mutex;
use tokio::time;

#[derive(Default)]
struct RecordingDispatcher {
    sent: Mutex<Vec<(TransportKind, Bytes)>>,
    fail: std::sync::atomic::AtomicBool,
}

impl RecordingDispatcher {
    async fn sent_count(&self) -> usize {
        self.sent.lock().await.len()
    }

    async fn sent_text(&self, idx: usize) -> String {
        let sent = self.sent.lock().await;
        String::from_utf8(sent[idx].1.to_vec()).unwrap()
    }
}

#[async_trait]
impl TransportDispatcher for RecordingDispatcher {
    async fn dispatch(&self, ctx: &TransportContext, payload: Bytes) -> Result<()> {
        if self.fail.load(std::sync::atomic::Ordering::Relaxed) {
            anyhow::bail!("link down");
        }
        self.sent.lock().await.push((ctx.kind, payload));
        Ok(())
    }

    fn local_contact(&self) -> (String, u16) {
        ("10.0.0.1".to_owned(), 5060)
    }
}

#[derive(Default)]
struct RecordingTu {
    provisionals: Mutex<Vec<u16>>,
    finals: Mutex<Vec<u16>>,
    terminations: Mutex<Vec<(String, TerminationKind)>>,
}

#[async_trait]
impl ClientTransactionUser for RecordingTu {
    async fn on_provisional(&self, _key: &TransactionKey, response: &Response) {
        self.provisionals.lock().await.push(response.code());
    }

    async fn on_final(&self, _key: &TransactionKey, response: &Response) {
        self.finals.lock().await.push(response.code());
    }

    async fn on_terminated(&self, _key: &TransactionKey, reason: &str, kind: TerminationKind) {
        self.terminations
            .lock()
            .await
            .push((reason.to_owned(), kind));
    }
}

fn udp_ctx() -> TransportContext {
    TransportContext::udp("192.0.2.10:5060".parse().unwrap())
}

fn request(method: Method, branch: &str) -> Request {
    let mut headers = Headers::new();
    headers.append(
        "Via",
        format!("SIP/2.0/UDP client.example.com:5060;branch={branch}"),
    );
    headers.append("From", "<sip:alice@example.com>;tag=1");
    headers.append("To", "<sip:bob@example.com>");
    headers.append("Call-ID", "txn-test");
    headers.append("CSeq", format!("1 {}", method.as_str()));
    Request::new(
        RequestLine::new(method, SipUri::parse("sip:bob@example.com").unwrap()),
        headers,
        Bytes::new(),
    )
}

fn response_for(req: &Request, code: u16) -> Response {
    let mut headers = Headers::new();
    for via in req.headers.get_all("Via") {
        headers.append("Via", via.clone());
    }
    if let Some(from) = req.headers.get_first("From") {
        headers.append("From", from.clone());
    }
    if let Some(to) = req.headers.get_first("To") {
        headers.append("To", format!("{};tag=resp", to));
    }
    if let Some(call_id) = req.headers.call_id() {
        headers.append("Call-ID", call_id.clone());
    }
    if let Some(cseq) = req.headers.get_first("CSeq") {
        headers.append("CSeq", cseq.clone());
    }
    Response::new(StatusLine::new(code, ""), headers, Bytes::new())
}

async fn wait_for<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if condition() {
            return;
        }
        time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn server_transaction_sends_final_response() {
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let manager = TransactionManager::new(dispatcher.clone());

    let outcome = manager
        .receive_request(request(Method::Options, "z9hG4bKsrv1"), udp_ctx())
        .await;
    let ReceiveOutcome::New(handle) = outcome else {
        panic!("expected a new transaction");
    };
    let req = request(Method::Options, "z9hG4bKsrv1");
    handle.send_final(response_for(&req, 200)).await;

    assert_eq!(dispatcher.sent_count().await, 1);
    assert!(dispatcher.sent_text(0).await.starts_with("SIP/2.0 200 OK"));
}

#[tokio::test]
async fn duplicate_request_retransmits_last_final() {
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let manager = TransactionManager::new(dispatcher.clone());

    let req = request(Method::Invite, "z9hG4bKdup");
    let ReceiveOutcome::New(handle) = manager.receive_request(req.clone(), udp_ctx()).await else {
        panic!("expected new");
    };
    handle.send_final(response_for(&req, 486)).await;
    assert_eq!(dispatcher.sent_count().await, 1);

    let outcome = manager.receive_request(req, udp_ctx()).await;
    assert!(matches!(outcome, ReceiveOutcome::Retransmission));
    assert_eq!(dispatcher.sent_count().await, 2);
}

#[tokio::test]
async fn ack_to_non_2xx_is_absorbed_by_invite_transaction() {
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let manager = TransactionManager::new(dispatcher.clone());

    let invite = request(Method::Invite, "z9hG4bKack1");
    let ReceiveOutcome::New(handle) = manager.receive_request(invite.clone(), udp_ctx()).await
    else {
        panic!("expected new");
    };
    handle.send_final(response_for(&invite, 486)).await;

    let ack = request(Method::Ack, "z9hG4bKack1");
    let outcome = manager.receive_request(ack, udp_ctx()).await;
    assert!(matches!(outcome, ReceiveOutcome::AckAbsorbed));
}

#[tokio::test]
async fn ack_to_2xx_bypasses_the_transaction_layer() {
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let manager = TransactionManager::new(dispatcher.clone());

    let invite = request(Method::Invite, "z9hG4bKack2");
    let ReceiveOutcome::New(handle) = manager.receive_request(invite.clone(), udp_ctx()).await
    else {
        panic!("expected new");
    };
    // 2xx terminates the server INVITE transaction immediately.
    handle.send_final(response_for(&invite, 200)).await;

    let ack = request(Method::Ack, "z9hG4bKack2");
    let outcome = manager.receive_request(ack, udp_ctx()).await;
    assert!(matches!(outcome, ReceiveOutcome::AckPassthrough));
}

#[tokio::test]
async fn client_transaction_delivers_provisional_and_final() {
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let manager = TransactionManager::new(dispatcher.clone());
    let tu = Arc::new(RecordingTu::default());

    let req = request(Method::Options, "z9hG4bKcli1");
    manager
        .start_client(req.clone(), udp_ctx(), tu.clone())
        .await
        .unwrap();
    assert_eq!(dispatcher.sent_count().await, 1);

    manager.receive_response(response_for(&req, 100)).await;
    manager.receive_response(response_for(&req, 200)).await;

    assert_eq!(tu.provisionals.lock().await.as_slice(), &[100]);
    assert_eq!(tu.finals.lock().await.as_slice(), &[200]);
}

#[tokio::test]
async fn client_invite_acks_non_2xx_automatically() {
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let manager = TransactionManager::new(dispatcher.clone());
    let tu = Arc::new(RecordingTu::default());

    let invite = request(Method::Invite, "z9hG4bKcli2");
    manager
        .start_client(invite.clone(), udp_ctx(), tu.clone())
        .await
        .unwrap();
    manager.receive_response(response_for(&invite, 486)).await;

    assert_eq!(tu.finals.lock().await.as_slice(), &[486]);

    // INVITE then ACK on the same branch.
    assert_eq!(dispatcher.sent_count().await, 2);
    let ack = dispatcher.sent_text(1).await;
    assert!(ack.starts_with("ACK sip:bob@example.com SIP/2.0"));
    assert!(ack.contains("branch=z9hG4bKcli2"));
    assert!(ack.contains("CSeq: 1 ACK"));
    assert!(ack.contains("tag=resp"));
}

#[tokio::test(start_paused = true)]
async fn client_invite_retransmit_schedule_and_timeout() {
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let manager = TransactionManager::new(dispatcher.clone());
    let tu = Arc::new(RecordingTu::default());

    let invite = request(Method::Invite, "z9hG4bKsched");
    manager
        .start_client(invite, udp_ctx(), tu.clone())
        .await
        .unwrap();

    // Let the spawned timer tasks and the command loop settle at each
    // step of virtual time.
    let advance = |ms: u64| async move {
        time::advance(Duration::from_millis(ms)).await;
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    };

    // Initial send.
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    assert_eq!(dispatcher.sent_count().await, 1);

    // RFC 3261 schedule: retransmits 500 ms, then +1 s, +2 s, +4 s, +4 s...
    advance(600).await;
    assert!(dispatcher.sent_count().await >= 2);

    advance(1100).await;
    assert!(dispatcher.sent_count().await >= 3);

    advance(2100).await;
    assert!(dispatcher.sent_count().await >= 4);

    advance(4100).await;
    assert!(dispatcher.sent_count().await >= 5);

    // At 64*T1 = 32 s the transaction gives up with a timeout.
    advance(32_000).await;
    let terminations = tu.terminations.lock().await;
    assert_eq!(terminations.len(), 1);
    assert_eq!(terminations[0].1, TerminationKind::Timeout);
}

#[tokio::test]
async fn transport_failure_terminates_client_transaction() {
    let dispatcher = Arc::new(RecordingDispatcher::default());
    dispatcher
        .fail
        .store(true, std::sync::atomic::Ordering::Relaxed);
    let manager = TransactionManager::new(dispatcher.clone());
    let tu = Arc::new(RecordingTu::default());

    let req = request(Method::Bye, "z9hG4bKfail");
    let key = manager
        .start_client(req, udp_ctx(), tu.clone())
        .await
        .unwrap();

    wait_for(|| {
        let guard = tu.terminations.try_lock();
        matches!(guard, Ok(t) if !t.is_empty())
    })
    .await;
    let terminations = tu.terminations.lock().await;
    assert_eq!(terminations[0].1, TerminationKind::TransportError);
    drop(terminations);
    assert!(!manager.has_client(&key));
}

#[tokio::test]
async fn tcp_non_invite_terminates_without_timer_k_wait() {
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let manager = TransactionManager::with_timers(
        dispatcher.clone(),
        TimerDefaults {
            t1: Duration::from_millis(10),
            t2: Duration::from_millis(40),
            t4: Duration::from_millis(50),
        },
    );
    let tu = Arc::new(RecordingTu::default());
    let ctx = TransportContext::new(TransportKind::Tcp, "192.0.2.10:5060".parse().unwrap());

    let req = request(Method::Options, "z9hG4bKtcp");
    let key = manager
        .start_client(req.clone(), ctx, tu.clone())
        .await
        .unwrap();
    manager.receive_response(response_for(&req, 200)).await;

    // Timer K is zero on reliable transports: the transaction vanishes
    // as soon as the zero-duration timer loops through the command queue.
    wait_for(|| !manager.has_client(&key)).await;
    assert_eq!(tu.finals.lock().await.as_slice(), &[200]);
}

#[tokio::test]
async fn cancel_matches_its_invite_transaction() {
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let manager = TransactionManager::new(dispatcher.clone());

    let invite = request(Method::Invite, "z9hG4bKcan");
    let ReceiveOutcome::New(_handle) = manager.receive_request(invite, udp_ctx()).await else {
        panic!("expected new");
    };

    let cancel = request(Method::Cancel, "z9hG4bKcan");
    assert!(manager.matching_invite(&cancel).is_some());

    let unrelated = request(Method::Cancel, "z9hG4bKother");
    assert!(manager.matching_invite(&unrelated).is_none());
}
