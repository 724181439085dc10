use super::*;
use crate::rsip_ext::RsipRequestExt;
use crate::transaction::make_reply;
use rsip::prelude::HeadersExt;
use std::time::Duration;

#[tokio::test]
async fn test_dialog_id_tag_roles() {
    let request = invite_request("c1@peer", "ftag", Some("ttag"), &[], vec![]);
    let request_id = DialogId::from_request(&request).unwrap();
    assert_eq!(request_id.call_id, "c1@peer");
    assert_eq!(request_id.local_tag, "ttag");
    assert_eq!(request_id.remote_tag, "ftag");

    // a response with the same headers reads the tags the other way around
    let response = make_reply(&request, StatusCode::OK);
    let response_id = DialogId::from_response(&response).unwrap();
    assert_eq!(response_id.local_tag, "ftag");
    assert_eq!(response_id.remote_tag, "ttag");

    assert!(request_id.is_established());
    let partial = DialogId {
        call_id: "c1@peer".to_string(),
        local_tag: "ttag".to_string(),
        remote_tag: String::new(),
    };
    assert!(!partial.is_established());
}

#[tokio::test]
async fn test_generate_request_cseq_strictly_increasing() {
    let request = invite_request("c2@peer", "ftag", None, &[], vec![]);
    let harness = server_dialog(DialogConfig::default(), &request).await;

    let mut last = 0u32;
    for i in 0..5 {
        let req = harness
            .dialog
            .generate_request(Method::Options, None, vec![])
            .unwrap();
        let seq = req.cseq_header().unwrap().seq().unwrap();
        if i > 0 {
            assert!(seq > last, "cseq {} not greater than {}", seq, last);
        }
        last = seq;
    }
}

#[tokio::test]
async fn test_strict_route_rewrites_request_uri() {
    let request = invite_request(
        "c3@peer",
        "ftag",
        None,
        &["<sip:proxy1.example.com>", "<sip:proxy2.example.com;lr>"],
        vec![],
    );
    let harness = server_dialog(DialogConfig::default(), &request).await;

    let bye = harness
        .dialog
        .generate_request(Method::Bye, None, vec![])
        .unwrap();
    // first route entry is strict: it becomes the request-URI and is popped
    assert_eq!(bye.uri.to_string(), "sip:proxy1.example.com");
    let routes: Vec<String> = bye
        .headers
        .iter()
        .filter_map(|h| match h {
            rsip::Header::Route(r) => Some(r.to_string()),
            _ => None,
        })
        .collect();
    assert_eq!(routes.len(), 1);
    assert!(routes[0].contains("proxy2"));
}

#[tokio::test]
async fn test_loose_route_leaves_request_uri() {
    let request = invite_request(
        "c4@peer",
        "ftag",
        None,
        &["<sip:proxy1.example.com;lr>"],
        vec![],
    );
    let harness = server_dialog(DialogConfig::default(), &request).await;

    let bye = harness
        .dialog
        .generate_request(Method::Bye, None, vec![])
        .unwrap();
    assert_eq!(bye.uri.to_string(), "sip:alice@peer.example.com:5060");
    let routes = bye
        .headers
        .iter()
        .filter(|h| matches!(h, rsip::Header::Route(_)))
        .count();
    assert_eq!(routes, 1);
}

#[tokio::test]
async fn test_route_set_captured_in_message_order() {
    let request = invite_request(
        "c5@peer",
        "ftag",
        None,
        &["<sip:p1.example.com;lr>", "<sip:p2.example.com;lr>"],
        vec![],
    );
    let routes = request.record_route_set();
    assert_eq!(routes.len(), 2);
    assert!(routes[0].to_string().contains("p1"));
    assert!(routes[1].to_string().contains("p2"));
}

#[tokio::test]
async fn test_end_is_idempotent() {
    let request = invite_request("c6@peer", "ftag", None, &[], vec![]);
    let harness = server_dialog(DialogConfig::default(), &request).await;

    harness.dialog.end().await;
    harness.dialog.end().await;
    // a late failure path must not produce a second notification either
    harness.dialog.fail(StatusCode::BusyHere).await;

    assert_eq!(harness.engine.rtp_stops.load(Ordering::SeqCst), 1);
    assert_eq!(harness.controller.ended.load(Ordering::SeqCst), 1);
    assert!(harness.controller.failed.lock().unwrap().is_empty());
    assert_eq!(harness.dialog.state(), DialogState::Terminated);
}

#[tokio::test]
async fn test_fail_and_end_are_exclusive() {
    let request = invite_request("c7@peer", "ftag", None, &[], vec![]);
    let harness = server_dialog(DialogConfig::default(), &request).await;

    harness.dialog.fail(StatusCode::BusyHere).await;
    harness.dialog.end().await;

    assert_eq!(
        harness.controller.failed.lock().unwrap().as_slice(),
        &[StatusCode::BusyHere]
    );
    assert_eq!(harness.controller.ended.load(Ordering::SeqCst), 0);
    assert_eq!(harness.engine.rtp_stops.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_reinvite_deferred_while_invite_outstanding() {
    let request = invite_request("c8@peer", "ftag", None, &[], vec![]);
    let harness = server_dialog(DialogConfig::default(), &request).await;
    // the initial INVITE transaction has not been acknowledged yet
    assert!(harness.dialog.invite_outstanding());

    harness
        .dialog
        .reinvite(None, test_sdp("10.0.0.2", 9100))
        .await
        .unwrap();
    assert_eq!(harness.dialog.state(), DialogState::ReinviteWaiting);
    assert!(harness.sender.requests_of(Method::Invite).is_empty());

    // ACK settles the initial transaction and releases the deferred re-INVITE
    let id = harness.dialog.id();
    let ack = ack_request(&id.call_id, &id.remote_tag, &id.local_tag, vec![]);
    harness.dialog.handle_ack(&ack).await.unwrap();

    let reinvites = harness.sender.requests_of(Method::Invite);
    assert_eq!(reinvites.len(), 1);
    let body = String::from_utf8(reinvites[0].body.clone()).unwrap();
    assert!(body.contains("m=audio 9100"));
    assert_eq!(harness.dialog.state(), DialogState::ReinviteSent);
}

#[tokio::test]
async fn test_reinvite_491_backs_off_and_retries() {
    let config = DialogConfig {
        glare_retry_other: (Duration::from_millis(1), Duration::from_millis(10)),
        ..DialogConfig::default()
    };
    let request = invite_request("c9@peer", "ftag", None, &[], vec![]);
    let harness = server_dialog(config, &request).await;

    let id = harness.dialog.id();
    let ack = ack_request(&id.call_id, &id.remote_tag, &id.local_tag, vec![]);
    harness.dialog.handle_ack(&ack).await.unwrap();

    harness
        .dialog
        .reinvite(None, test_sdp("10.0.0.2", 9100))
        .await
        .unwrap();
    let sent = harness.sender.requests_of(Method::Invite);
    assert_eq!(sent.len(), 1);

    let pending = make_reply(&sent[0], StatusCode::RequestPending);
    harness
        .dialog
        .handle_reinvite_response(&pending)
        .await
        .unwrap();
    assert_eq!(harness.dialog.state(), DialogState::Confirmed);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let sent = harness.sender.requests_of(Method::Invite);
    assert_eq!(sent.len(), 2, "collided re-INVITE was not retried");
    assert_eq!(sent[1].body, sent[0].body);
}

#[tokio::test]
async fn test_reinvite_merges_session() {
    let request = invite_request("c10@peer", "ftag", None, &[], vec![]);
    let harness = server_dialog(DialogConfig::default(), &request).await;
    harness.dialog.set_session(test_sdp("10.0.0.1", 8000));

    let id = harness.dialog.id();
    let ack = ack_request(&id.call_id, &id.remote_tag, &id.local_tag, vec![]);
    harness.dialog.handle_ack(&ack).await.unwrap();

    let mut update = test_sdp("", 9100);
    update.connection = None;
    update.origin.address = String::new();
    update.origin.network_type = String::new();
    update.origin.address_type = String::new();
    harness.dialog.reinvite(None, update).await.unwrap();

    let session = harness.dialog.session().unwrap();
    assert_eq!(session.media[0].port, 9100);
    assert_eq!(session.connection.as_ref().unwrap().address, "10.0.0.1");
    assert_eq!(session.origin.version, 2);
}

#[tokio::test]
async fn test_ack_reuses_invite_cseq() {
    let request = invite_request("c11@peer", "ftag", None, &[], vec![]);
    let harness = server_dialog(DialogConfig::default(), &request).await;

    let id = harness.dialog.id();
    let ack = ack_request(&id.call_id, &id.remote_tag, &id.local_tag, vec![]);
    harness.dialog.handle_ack(&ack).await.unwrap();

    harness
        .dialog
        .reinvite(None, test_sdp("10.0.0.2", 9100))
        .await
        .unwrap();
    let sent = harness.sender.requests_of(Method::Invite);
    let invite_seq = sent[0].cseq_header().unwrap().seq().unwrap();

    let ok = make_reply(&sent[0], StatusCode::OK);
    harness.dialog.handle_reinvite_response(&ok).await.unwrap();

    let acks = harness.sender.requests_of(Method::Ack);
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].cseq_header().unwrap().seq().unwrap(), invite_seq);
    assert!(acks[0].body.is_empty());
}
