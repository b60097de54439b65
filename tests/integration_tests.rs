//! End-to-end protocol scenarios over an in-process link.

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use common::{PAGE, RecordingMonitor, TestClient, pgw_payload, rw_body};
use rootd::{
    AuthOutcome, ClientIdent, Config, FsError, FsResult, MemFs, Security, Server, crc32c_of,
};
use sha2::{Digest, Sha256};

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 0x30) as u8).collect()
}

fn server_with(fs: Arc<MemFs>) -> Arc<Server> {
    common::init_logging();
    Arc::new(Server::new(fs))
}

/// Parse a pgread frame body into (offset, pages-as-(crc, data)).
fn parse_pg_frame(body: &[u8]) -> (i64, Vec<(u32, Vec<u8>)>) {
    let ofs = i64::from_be_bytes(body[0..8].try_into().unwrap());
    let mut units = Vec::new();
    let mut at = 8;
    while at < body.len() {
        let crc = u32::from_be_bytes(body[at..at + 4].try_into().unwrap());
        at += 4;
        let dlen = (body.len() - at).min(PAGE);
        units.push((crc, body[at..at + dlen].to_vec()));
        at += dlen;
    }
    (ofs, units)
}

// ---------------------------------------------------------------------- S1

#[tokio::test]
async fn s1_login_ping_disconnect() {
    let fs = MemFs::new();
    let monitor = Arc::new(RecordingMonitor::default());
    let server = Arc::new(Server::new(fs).monitor(monitor.clone()));
    let (mut client, task) = TestClient::connect(server);

    let (pval, styp) = client.handshake().await;
    assert_eq!(pval, 0x400);
    assert_eq!(styp, 1);

    let mut body = [0u8; 16];
    body[0..4].copy_from_slice(&100i32.to_be_bytes());
    body[4..6].copy_from_slice(b"ab");
    client.request([9, 9], 3007, &body, &[]).await;
    let reply = client.response().await;
    assert_eq!(reply.sid, [9, 9]);
    assert_eq!(reply.status, 0);
    assert!(reply.body.is_empty(), "login body should be empty");

    client.request([9, 10], 3011, &[0u8; 16], &[]).await;
    let reply = client.response().await;
    assert_eq!(reply.sid, [9, 10]);
    assert_eq!(reply.status, 0);
    assert!(reply.body.is_empty());

    client.hangup();
    let _ = task.await.unwrap();
    let discs = monitor.discs.lock().unwrap();
    assert_eq!(discs.len(), 1, "exactly one disconnect record");
}

// ---------------------------------------------------------------------- S2

#[tokio::test]
async fn s2_open_read_close() {
    let content = patterned(12288);
    let fs = MemFs::new();
    fs.insert("/data/three_pages", &content);
    let server = server_with(fs);
    let (mut client, _task) = TestClient::connect(server);

    client.handshake().await;
    client.login("ab", 100).await;
    let fh = client.open([0, 2], "/data/three_pages", 0x10).await;
    let (status, data) = client.read([0, 3], fh, 0, 12288).await;
    assert_eq!(status, 0);
    assert_eq!(Sha256::digest(&data)[..], Sha256::digest(&content)[..]);

    let reply = client.close([0, 4], fh).await;
    assert_eq!(reply.status, 0);
}

// ---------------------------------------------------------------------- S3

#[tokio::test]
async fn s3_pgread_with_retry() {
    let content = patterned(3 * PAGE);
    let fs = MemFs::new();
    fs.insert("/pg/data", &content);
    // A one-page transfer unit forces one frame per page.
    let config = Config {
        max_transz: PAGE,
        ..Config::default()
    };
    let server = Arc::new(Server::with_config(fs, config));
    let (mut client, _task) = TestClient::connect(server);

    client.handshake().await;
    client.login("ab", 100).await;
    let fh = client.open([1, 0], "/pg/data", 0x10).await;

    let mut first_crcs = Vec::new();
    for flags in [0u8, 1u8] {
        let frames = client.pgread([1, 1], fh, 0, (3 * PAGE) as i32, flags).await;
        assert_eq!(frames.len(), 3);
        let mut crcs = Vec::new();
        for (i, frame) in frames.iter().enumerate() {
            let terminal = i == frames.len() - 1;
            assert_eq!(frame.status, if terminal { 0 } else { 4000 });
            let (ofs, units) = parse_pg_frame(&frame.body);
            assert_eq!(ofs, (i * PAGE) as i64);
            for (j, (crc, page)) in units.iter().enumerate() {
                let at = i * PAGE + j * PAGE;
                assert_eq!(page.as_slice(), &content[at..at + PAGE]);
                assert_eq!(*crc, crc32c_of(page), "wire CRC must cover the page");
                crcs.push(*crc);
            }
        }
        if flags == 0 {
            first_crcs = crcs;
        } else {
            assert_eq!(first_crcs, crcs, "retry must produce identical checksums");
        }
    }
}

// ---------------------------------------------------------------------- S4

#[tokio::test]
async fn s4_pgwrite_with_one_bad_checksum() {
    let fs = MemFs::new();
    fs.insert("/pg/out", &vec![0u8; 4 * PAGE]);
    let server = server_with(fs.clone());
    let (mut client, _task) = TestClient::connect(server);

    client.handshake().await;
    client.login("ab", 100).await;
    let fh = client.open([2, 0], "/pg/out", 0x20).await;

    let intended: Vec<u8> = (0..3 * PAGE).map(|i| (i % 251) as u8).collect();
    let payload = pgw_payload(4096, &intended, &[8192]);
    let reply = client.pgwrite([2, 1], fh, 4096, &payload).await;
    assert_eq!(reply.status, 0);

    // Body: request offset, then the corrective record.
    assert_eq!(
        i64::from_be_bytes(reply.body[0..8].try_into().unwrap()),
        4096
    );
    let record = &reply.body[8..];
    assert_eq!(record.len(), 8 + 8, "one failing offset expected");
    let crc = u32::from_be_bytes(record[0..4].try_into().unwrap());
    assert_eq!(crc, crc32c_of(&record[4..]));
    assert_eq!(i16::from_be_bytes([record[4], record[5]]), PAGE as i16);
    assert_eq!(i16::from_be_bytes([record[6], record[7]]), PAGE as i16);
    assert_eq!(
        i64::from_be_bytes(record[8..16].try_into().unwrap()),
        8192,
        "exactly the corrupted page's offset"
    );

    // The intact pages landed.
    let now = fs.contents("/pg/out").unwrap();
    assert_eq!(&now[4096..8192], &intended[..PAGE]);
    assert_eq!(&now[12288..16384], &intended[2 * PAGE..]);

    // Resubmit the failing page with a good checksum; the book clears.
    let fix = pgw_payload(8192, &intended[PAGE..2 * PAGE], &[]);
    let reply = client.pgwrite([2, 2], fh, 8192, &fix).await;
    assert_eq!(reply.status, 0);
    assert_eq!(reply.body.len(), 8, "no corrective record after the fix");

    let now = fs.contents("/pg/out").unwrap();
    assert_eq!(&now[4096..16384], &intended[..]);
}

// ---------------------------------------------------------------------- S5

#[tokio::test]
async fn s5_checkpoint_rollback_of_truncate() {
    let fs = MemFs::new();
    fs.insert("/ck/file", b"0123456789");
    let server = server_with(fs.clone());
    let (mut client, _task) = TestClient::connect(server);

    client.handshake().await;
    client.login("ab", 100).await;
    let fh = client.open([3, 0], "/ck/file", 0x20).await;

    let reply = client.chkpoint([3, 1], fh, 0).await; // begin
    assert_eq!(reply.status, 0);

    let mut trunc_body = [0u8; 16];
    trunc_body[0..4].copy_from_slice(&fh);
    // size 0 is already encoded by the zeroed offset field
    client.chkpoint_xeq([3, 2], fh, 3028, &trunc_body, 0).await;
    let reply = client.response().await;
    assert_eq!(reply.status, 0);
    assert_eq!(fs.contents("/ck/file").unwrap().len(), 0);

    let reply = client.chkpoint([3, 3], fh, 3).await; // rollback
    assert_eq!(reply.status, 0);

    let reply = client.stat_path([3, 4], "/ck/file").await;
    assert_eq!(reply.status, 0);
    let text = String::from_utf8_lossy(&reply.body);
    let size: i64 = text.trim_end_matches('\0').split(' ').nth(1).unwrap().parse().unwrap();
    assert_eq!(size, 10);

    let (status, data) = client.read([3, 5], fh, 0, 10).await;
    assert_eq!(status, 0);
    assert_eq!(data, b"0123456789");
}

#[tokio::test]
async fn checkpointed_writes_roll_back_and_commit() {
    let fs = MemFs::new();
    fs.insert("/ck/w", b"AAAABBBB");
    let server = server_with(fs.clone());
    let (mut client, _task) = TestClient::connect(server);

    client.handshake().await;
    client.login("ab", 100).await;
    let fh = client.open([4, 0], "/ck/w", 0x20).await;

    // begin -> write A -> write B -> rollback
    assert_eq!(client.chkpoint([4, 1], fh, 0).await.status, 0);
    let wbody = rw_body(fh, 0, 0);
    client.chkpoint_xeq([4, 2], fh, 3019, &wbody, 4).await;
    client.send_raw(b"XXXX").await;
    assert_eq!(client.response().await.status, 0);
    let wbody = rw_body(fh, 4, 0);
    client.chkpoint_xeq([4, 3], fh, 3019, &wbody, 4).await;
    client.send_raw(b"YYYY").await;
    assert_eq!(client.response().await.status, 0);
    assert_eq!(fs.contents("/ck/w").unwrap(), b"XXXXYYYY");
    assert_eq!(client.chkpoint([4, 4], fh, 3).await.status, 0);
    assert_eq!(fs.contents("/ck/w").unwrap(), b"AAAABBBB");

    // begin -> write A -> commit
    assert_eq!(client.chkpoint([4, 5], fh, 0).await.status, 0);
    let wbody = rw_body(fh, 0, 0);
    client.chkpoint_xeq([4, 6], fh, 3019, &wbody, 4).await;
    client.send_raw(b"ZZZZ").await;
    assert_eq!(client.response().await.status, 0);
    assert_eq!(client.chkpoint([4, 7], fh, 1).await.status, 0);
    assert_eq!(fs.contents("/ck/w").unwrap(), b"ZZZZBBBB");
}

#[tokio::test]
async fn checkpoint_query_reports_slot_usage() {
    let fs = MemFs::new();
    fs.insert("/ck/q", b"0123456789");
    let server = server_with(fs);
    let (mut client, _task) = TestClient::connect(server);

    client.handshake().await;
    client.login("ab", 100).await;
    let fh = client.open([5, 0], "/ck/q", 0x20).await;

    assert_eq!(client.chkpoint([5, 1], fh, 0).await.status, 0);
    let reply = client.chkpoint([5, 2], fh, 2).await; // query
    assert_eq!(reply.status, 0);
    assert_eq!(reply.body.len(), 8);
    let max = u32::from_be_bytes(reply.body[0..4].try_into().unwrap());
    let used = u32::from_be_bytes(reply.body[4..8].try_into().unwrap());
    assert!(max > 0);
    assert_eq!(used, 0);

    // A covered write consumes slot space.
    let wbody = rw_body(fh, 0, 0);
    client.chkpoint_xeq([5, 3], fh, 3019, &wbody, 4).await;
    client.send_raw(b"xxxx").await;
    assert_eq!(client.response().await.status, 0);
    let reply = client.chkpoint([5, 4], fh, 2).await;
    let used = u32::from_be_bytes(reply.body[4..8].try_into().unwrap());
    assert!(used > 0);
}

// ---------------------------------------------------------------------- S6

#[tokio::test]
async fn s6_link_close_with_outstanding_writev() {
    const ELEM: usize = 8 << 20;
    let fs = MemFs::new();
    let monitor = Arc::new(RecordingMonitor::default());
    let server = Arc::new(Server::new(fs.clone()).monitor(monitor.clone()));
    let (mut client, task) = TestClient::connect(server);

    client.handshake().await;
    client.login("ab", 100).await;
    let fh = client.open([6, 0], "/big", 0x08).await; // new

    // Vector of 8 elements, 64 MiB total.
    let mut vector = Vec::new();
    for i in 0..8 {
        vector.extend_from_slice(&fh);
        vector.extend_from_slice(&(ELEM as i32).to_be_bytes());
        vector.extend_from_slice(&((i * ELEM) as i64).to_be_bytes());
    }
    client
        .request_hdr([6, 1], 3031, &[0u8; 16], vector.len() as i32)
        .await;
    client.send_raw(&vector).await;

    // Feed half the data, then hang up.
    let chunk = vec![7u8; 1 << 20];
    for _ in 0..32 {
        client.send_raw(&chunk).await;
    }
    client.hangup();
    let _ = task.await.unwrap();

    let stored = fs.contents("/big").unwrap();
    assert_eq!(stored.len(), 32 << 20, "backend holds exactly what was sent");

    let closes = monitor.closes.lock().unwrap();
    assert_eq!(closes.len(), 1, "one close record for the open file");
    assert_eq!(
        closes[0].2,
        stored.len() as i64,
        "monitored bytes-written match what the backend accepted"
    );
}

// ------------------------------------------------------------- invariants

#[tokio::test]
async fn file_handles_are_stable_and_reused_only_after_close() {
    let fs = MemFs::new();
    fs.insert("/a", b"1");
    fs.insert("/b", b"2");
    fs.insert("/c", b"3");
    let server = server_with(fs);
    let (mut client, _task) = TestClient::connect(server);

    client.handshake().await;
    client.login("ab", 100).await;
    let fa = client.open([7, 0], "/a", 0x10).await;
    let fb = client.open([7, 1], "/b", 0x10).await;
    assert_ne!(fa, fb);

    // Handles stay valid while other files churn.
    assert_eq!(client.close([7, 2], fb).await.status, 0);
    let fc = client.open([7, 3], "/c", 0x10).await;
    assert_eq!(fc, fb, "lowest free slot is reused only after close");
    let (status, data) = client.read([7, 4], fa, 0, 1).await;
    assert_eq!(status, 0);
    assert_eq!(data, b"1");
}

#[tokio::test]
async fn second_writer_is_locked_out_until_close() {
    let fs = MemFs::new();
    fs.insert("/lk", b"x");
    let server = server_with(fs);
    let (mut client, _task) = TestClient::connect(server);

    client.handshake().await;
    client.login("ab", 100).await;
    let fh = client.open([20, 0], "/lk", 0x20).await;

    // A second writer on the same backend object is refused.
    let body = {
        let mut b = [0u8; 16];
        b[2..4].copy_from_slice(&0x20u16.to_be_bytes());
        b
    };
    client.request([20, 1], 3010, &body, b"/lk").await;
    let reply = client.response().await;
    assert_eq!(reply.status, 4003);
    assert_eq!(
        i32::from_be_bytes(reply.body[0..4].try_into().unwrap()),
        3003 // FileLocked
    );

    assert_eq!(client.close([20, 2], fh).await.status, 0);
    let fh = client.open([20, 3], "/lk", 0x20).await;
    assert_eq!(client.close([20, 4], fh).await.status, 0);
}

#[tokio::test]
async fn requests_before_login_close_the_connection() {
    let fs = MemFs::new();
    let server = server_with(fs);
    let (mut client, task) = TestClient::connect(server);

    client.handshake().await;
    client.request([0, 1], 3011, &[0u8; 16], &[]).await; // ping pre-login
    let reply = client.response().await;
    assert_eq!(reply.status, 4003);
    assert_eq!(
        i32::from_be_bytes(reply.body[0..4].try_into().unwrap()),
        3006 // InvalidRequest
    );
    assert!(task.await.unwrap().is_err(), "connection must be closed");
}

#[tokio::test]
async fn bad_handshake_closes_the_connection() {
    let fs = MemFs::new();
    let server = server_with(fs);
    let (mut client, task) = TestClient::connect(server);
    client.send_raw(&[1u8; 20]).await;
    assert!(task.await.unwrap().is_err());
}

#[tokio::test]
async fn misaligned_pgread_is_rejected() {
    let fs = MemFs::new();
    fs.insert("/pg", &vec![0u8; 2 * PAGE]);
    let server = server_with(fs);
    let (mut client, _task) = TestClient::connect(server);

    client.handshake().await;
    client.login("ab", 100).await;
    let fh = client.open([8, 0], "/pg", 0x10).await;

    client
        .request([8, 1], 3030, &rw_body(fh, 100, PAGE as i32), &[])
        .await;
    let reply = client.response().await;
    assert_eq!(reply.status, 4003);
    assert_eq!(
        i32::from_be_bytes(reply.body[0..4].try_into().unwrap()),
        3000 // ArgInvalid
    );

    client
        .request([8, 2], 3030, &rw_body(fh, 0, 100), &[])
        .await;
    let reply = client.response().await;
    assert_eq!(reply.status, 4003);
}

#[tokio::test]
async fn write_then_read_back() {
    let fs = MemFs::new();
    let server = server_with(fs.clone());
    let (mut client, _task) = TestClient::connect(server);

    client.handshake().await;
    client.login("ab", 100).await;
    let fh = client.open([10, 0], "/w", 0x08).await;
    let data = patterned(300_000); // several sync chunks
    let reply = client.write([10, 1], fh, 0, &data).await;
    assert_eq!(reply.status, 0);
    let (status, back) = client.read([10, 2], fh, 0, data.len() as i32).await;
    assert_eq!(status, 0);
    assert_eq!(back, data);
    assert_eq!(fs.contents("/w").unwrap(), data);
}

#[tokio::test]
async fn write_to_bad_handle_preserves_wire_alignment() {
    let fs = MemFs::new();
    let server = server_with(fs);
    let (mut client, _task) = TestClient::connect(server);

    client.handshake().await;
    client.login("ab", 100).await;
    let reply = client.write([11, 0], [9, 9, 9, 9], 0, b"discarded").await;
    assert_eq!(reply.status, 4003);
    assert_eq!(
        i32::from_be_bytes(reply.body[0..4].try_into().unwrap()),
        3004 // FileNotOpen
    );
    // The connection is still usable afterwards.
    client.request([11, 1], 3011, &[0u8; 16], &[]).await;
    assert_eq!(client.response().await.status, 0);
}

#[tokio::test]
async fn readv_returns_elements_in_order() {
    let fs = MemFs::new();
    fs.insert("/ra", b"aaaaaaaa");
    fs.insert("/rb", b"bbbb");
    let server = server_with(fs);
    let (mut client, _task) = TestClient::connect(server);

    client.handshake().await;
    client.login("ab", 100).await;
    let fa = client.open([12, 0], "/ra", 0x10).await;
    let fb = client.open([12, 1], "/rb", 0x10).await;

    let mut vector = Vec::new();
    for (fh, len, off) in [(fa, 4i32, 4i64), (fb, 4, 0)] {
        vector.extend_from_slice(&fh);
        vector.extend_from_slice(&len.to_be_bytes());
        vector.extend_from_slice(&off.to_be_bytes());
    }
    client.request([12, 2], 3025, &[0u8; 16], &vector).await;

    let first = client.response().await;
    assert_eq!(first.status, 4000);
    assert_eq!(&first.body[16..], b"aaaa");
    assert_eq!(&first.body[0..4], &fa);
    let second = client.response().await;
    assert_eq!(second.status, 0);
    assert_eq!(&second.body[16..], b"bbbb");
}

#[tokio::test]
async fn fattr_round_trip_over_the_wire() {
    let fs = MemFs::new();
    fs.insert("/xa", b"x");
    let server = server_with(fs);
    let (mut client, _task) = TestClient::connect(server);

    client.handshake().await;
    client.login("ab", 100).await;

    // set one attribute by path
    let mut body = [0u8; 16];
    body[4] = 3; // set
    body[5] = 1; // numattr
    let mut payload = b"/xa\0".to_vec();
    payload.extend_from_slice(&[0, 0]);
    payload.extend_from_slice(b"color\0");
    payload.extend_from_slice(&3u32.to_be_bytes());
    payload.extend_from_slice(b"red");
    client.request([13, 0], 3020, &body, &payload).await;
    let reply = client.response().await;
    assert_eq!(reply.status, 0);
    assert_eq!(reply.body[0], 0, "no per-attribute errors");
    assert_eq!(reply.body[1], 1);

    // get it back
    let mut body = [0u8; 16];
    body[4] = 1; // get
    body[5] = 1;
    let mut payload = b"/xa\0".to_vec();
    payload.extend_from_slice(&[0, 0]);
    payload.extend_from_slice(b"color\0");
    client.request([13, 1], 3020, &body, &payload).await;
    let reply = client.response().await;
    assert_eq!(reply.status, 0);
    assert_eq!(reply.body[0], 0);
    let tail = &reply.body[reply.body.len() - 7..];
    assert_eq!(u32::from_be_bytes(tail[0..4].try_into().unwrap()), 3);
    assert_eq!(&tail[4..], b"red");

    // a get of a missing attribute reports one error
    let mut payload = b"/xa\0".to_vec();
    payload.extend_from_slice(&[0, 0]);
    payload.extend_from_slice(b"nope\0");
    client.request([13, 2], 3020, &body, &payload).await;
    let reply = client.response().await;
    assert_eq!(reply.status, 0);
    assert_eq!(reply.body[0], 1, "one failing attribute");

    // delete it
    let mut body = [0u8; 16];
    body[4] = 0; // del
    body[5] = 1;
    let mut payload = b"/xa\0".to_vec();
    payload.extend_from_slice(&[0, 0]);
    payload.extend_from_slice(b"color\0");
    client.request([13, 3], 3020, &body, &payload).await;
    assert_eq!(client.response().await.status, 0);
}

#[tokio::test]
async fn namespace_operations() {
    let fs = MemFs::new();
    let server = server_with(fs.clone());
    let (mut client, _task) = TestClient::connect(server);

    client.handshake().await;
    client.login("ab", 100).await;

    // mkdir
    let mut body = [0u8; 16];
    body[0] = 1; // mkpath
    client.request([14, 0], 3008, &body, b"/dir/sub").await;
    assert_eq!(client.response().await.status, 0);

    // create a file in it, then list
    let fh = client.open([14, 1], "/dir/sub/f", 0x08).await;
    client.close([14, 2], fh).await;
    client.request([14, 3], 3004, &[0u8; 16], b"/dir/sub").await;
    let (status, listing) = client.collect([14, 3]).await;
    assert_eq!(status, 0);
    assert_eq!(&listing[..listing.len() - 1], b"f");

    // mv and stat
    client
        .request([14, 4], 3009, &[0u8; 16], b"/dir/sub/f /dir/sub/g")
        .await;
    assert_eq!(client.response().await.status, 0);
    let reply = client.stat_path([14, 5], "/dir/sub/g").await;
    assert_eq!(reply.status, 0);

    // rm
    client.request([14, 6], 3014, &[0u8; 16], b"/dir/sub/g").await;
    assert_eq!(client.response().await.status, 0);
    let reply = client.stat_path([14, 7], "/dir/sub/g").await;
    assert_eq!(reply.status, 4003);

    // relative paths are screened
    client.request([14, 8], 3014, &[0u8; 16], b"/x/../y").await;
    let reply = client.response().await;
    assert_eq!(reply.status, 4003);
    assert_eq!(
        i32::from_be_bytes(reply.body[0..4].try_into().unwrap()),
        3010 // NotAuthorized
    );
}

#[tokio::test]
async fn endsess_terminates_the_session() {
    let fs = MemFs::new();
    let server = server_with(fs);
    let (mut client, task) = TestClient::connect(server);

    client.handshake().await;
    client.login("ab", 100).await;
    client.request([15, 0], 3023, &[0u8; 16], &[]).await;
    let reply = client.response().await;
    assert_eq!(reply.status, 0);
    assert!(task.await.unwrap().is_ok(), "endsess is a graceful end");
}

struct OneRoundSec;

#[async_trait]
impl Security for OneRoundSec {
    fn get_parms(&self, _host: &str) -> Option<Vec<u8>> {
        Some(b"&P=unix".to_vec())
    }

    async fn authenticate(&self, cred: &[u8], client: &mut ClientIdent) -> FsResult<AuthOutcome> {
        if cred == b"unixcred" {
            client.name = "authed".into();
            Ok(AuthOutcome::Done)
        } else {
            Err(FsError::io(libc::EACCES, "bad credentials"))
        }
    }
}

#[tokio::test]
async fn auth_gates_the_session() {
    let fs = MemFs::new();
    fs.insert("/sec", b"secret");
    let server = Arc::new(Server::new(fs).security(Arc::new(OneRoundSec)));
    let (mut client, _task) = TestClient::connect(server);

    client.handshake().await;
    let mut body = [0u8; 16];
    body[0..4].copy_from_slice(&1i32.to_be_bytes());
    body[4..6].copy_from_slice(b"ab");
    client.request([16, 0], 3007, &body, &[]).await;
    let reply = client.response().await;
    assert_eq!(reply.status, 0);
    assert_eq!(reply.body, b"&P=unix", "login returns the security token");

    // ping is allowed before authentication completes
    client.request([16, 1], 3011, &[0u8; 16], &[]).await;
    assert_eq!(client.response().await.status, 0);

    client.request([16, 2], 3000, &[0u8; 16], b"unixcred").await;
    assert_eq!(client.response().await.status, 0);

    let fh = client.open([16, 3], "/sec", 0x10).await;
    let (status, data) = client.read([16, 4], fh, 0, 6).await;
    assert_eq!(status, 0);
    assert_eq!(data, b"secret");
}

#[tokio::test]
async fn async_open_reads_deliver_in_offset_order() {
    // A large async-mode read exercises the task engine end to end.
    let content = patterned(1 << 20);
    let fs = MemFs::new();
    fs.insert("/async", &content);
    let server = server_with(fs);
    let (mut client, _task) = TestClient::connect(server);

    client.handshake().await;
    client.login("ab", 100).await;
    let fh = client.open([17, 0], "/async", 0x10 | 0x40).await; // read|async
    let (status, data) = client.read([17, 1], fh, 0, content.len() as i32).await;
    assert_eq!(status, 0);
    assert_eq!(data.len(), content.len());
    assert_eq!(data, content, "bytes must arrive in strictly ascending order");
    assert_eq!(client.close([17, 2], fh).await.status, 0);
}

#[tokio::test]
async fn writev_executes_elements_in_order() {
    let fs = MemFs::new();
    let server = server_with(fs.clone());
    let (mut client, _task) = TestClient::connect(server);

    client.handshake().await;
    client.login("ab", 100).await;
    let fh = client.open([18, 0], "/wv", 0x08).await;

    let mut vector = Vec::new();
    for (len, off) in [(4i32, 0i64), (4, 4), (4, 8)] {
        vector.extend_from_slice(&fh);
        vector.extend_from_slice(&len.to_be_bytes());
        vector.extend_from_slice(&off.to_be_bytes());
    }
    client
        .request_hdr([18, 1], 3031, &[0u8; 16], vector.len() as i32)
        .await;
    client.send_raw(&vector).await;
    client.send_raw(b"aaaabbbbcccc").await;
    let reply = client.response().await;
    assert_eq!(reply.status, 0);
    assert_eq!(fs.contents("/wv").unwrap(), b"aaaabbbbcccc");
}

#[tokio::test]
async fn checkpointed_writev_rejects_mixed_files() {
    let fs = MemFs::new();
    fs.insert("/m1", b"11111111");
    fs.insert("/m2", b"22222222");
    let server = server_with(fs);
    let (mut client, task) = TestClient::connect(server);

    client.handshake().await;
    client.login("ab", 100).await;
    let f1 = client.open([19, 0], "/m1", 0x20).await;
    let f2 = client.open([19, 1], "/m2", 0x20).await;
    assert_eq!(client.chkpoint([19, 2], f1, 0).await.status, 0);

    let mut vector = Vec::new();
    for (fh, len, off) in [(f1, 4i32, 0i64), (f2, 4, 0)] {
        vector.extend_from_slice(&fh);
        vector.extend_from_slice(&len.to_be_bytes());
        vector.extend_from_slice(&off.to_be_bytes());
    }
    client
        .chkpoint_xeq([19, 3], f1, 3031, &[0u8; 16], vector.len() as i32)
        .await;
    client.send_raw(&vector).await;
    let reply = client.response().await;
    assert_eq!(reply.status, 4003);
    assert_eq!(
        i32::from_be_bytes(reply.body[0..4].try_into().unwrap()),
        3013 // Unsupported
    );
    assert!(task.await.unwrap().is_err());
}
