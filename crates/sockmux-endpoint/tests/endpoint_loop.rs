//! End-to-end tests driving an `Endpoint` with real Unix-socket clients.

use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use sockmux_endpoint::{opcodes, Endpoint, EndpointError, Message, IMPULSE_MESSAGE_ID};
use sockmux_handle::stream_pair;
use sockmux_wire::{
    recv_response, send_all, send_request, RequestHeader, WireError, IMPULSE_PAYLOAD_SIZE,
};

fn socket_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("sockmux-{}-{}", name, std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir.join("endpoint.sock")
}

fn cleanup(path: &Path) {
    if let Some(dir) = path.parent() {
        let _ = std::fs::remove_dir_all(dir);
    }
}

fn connect_retrying(path: &Path) -> UnixStream {
    for _ in 0..100 {
        match UnixStream::connect(path) {
            Ok(stream) => return stream,
            Err(_) => thread::sleep(Duration::from_millis(10)),
        }
    }
    panic!("could not connect to {path:?}");
}

fn open_channel(path: &Path) -> UnixStream {
    let stream = connect_retrying(path);
    let header = RequestHeader {
        op: opcodes::CHANNEL_OPEN,
        ..RequestHeader::default()
    };
    send_request(stream.as_fd(), &header, b"", &[], &[]).unwrap();
    stream
}

#[test]
fn channel_open_replies_with_event_handle() {
    let path = socket_path("open");
    let endpoint = Endpoint::bind(&path, true).unwrap();

    let client_path = path.clone();
    let client = thread::spawn(move || {
        let stream = open_channel(&client_path);
        let response = recv_response(stream.as_fd()).unwrap();
        (stream, response)
    });

    let mut message = endpoint.wait().unwrap();
    assert_eq!(message.op(), opcodes::CHANNEL_OPEN);
    assert_eq!(message.credentials().pid, std::process::id() as i32);
    let channel_id = message.channel_id();
    endpoint.reply(&mut message, 0).unwrap();

    let (_stream, response) = client.join().unwrap();
    // The return code is the index of the single pushed reference.
    assert_eq!(response.header.ret_code, 0);
    assert_eq!(response.files.len(), 1);
    assert!(response.payload.is_empty());

    // The channel stays open after a successful open.
    assert_eq!(endpoint.channel_count(), 1);

    // The received reference is a usable event handle: raising a pending
    // event on the channel makes it readable.
    let event = response.files.into_iter().next().unwrap();
    endpoint.modify_channel_events(channel_id, 0, 0x1).unwrap();
    let mut pfd = libc::pollfd {
        fd: event.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    // SAFETY: polls one valid pollfd.
    let ready = unsafe { libc::poll(&mut pfd, 1, 2000) };
    assert_eq!(ready, 1);

    // Clearing the last pending bit drains the eventfd: the handle goes
    // quiet again.
    endpoint.modify_channel_events(channel_id, 0x1, 0).unwrap();
    pfd.revents = 0;
    // SAFETY: polls one valid pollfd.
    let ready = unsafe { libc::poll(&mut pfd, 1, 0) };
    assert_eq!(ready, 0);

    cleanup(&path);
}

#[test]
fn inherited_listener_rejects_bad_environment() {
    // One test owns all the LISTEN_* probing: the variables are process
    // globals, so the cases run sequentially here.
    std::env::remove_var("LISTEN_PID");
    std::env::remove_var("LISTEN_FDS");
    std::env::remove_var("LISTEN_FDNAMES");
    assert!(matches!(
        Endpoint::from_inherited("control", true),
        Err(EndpointError::InheritedListener { .. })
    ));

    std::env::set_var("LISTEN_PID", (std::process::id() + 1).to_string());
    std::env::set_var("LISTEN_FDS", "1");
    std::env::set_var("LISTEN_FDNAMES", "control");
    let err = Endpoint::from_inherited("control", true).unwrap_err();
    match err {
        EndpointError::InheritedListener { name, reason } => {
            assert_eq!(name, "control");
            assert!(reason.contains("another process"), "reason: {reason}");
        }
        other => panic!("expected InheritedListener, got {other:?}"),
    }

    std::env::set_var("LISTEN_PID", std::process::id().to_string());
    std::env::set_var("LISTEN_FDNAMES", "other");
    let err = Endpoint::from_inherited("control", true).unwrap_err();
    match err {
        EndpointError::InheritedListener { reason, .. } => {
            assert!(reason.contains("no such listener"), "reason: {reason}");
        }
        other => panic!("expected InheritedListener, got {other:?}"),
    }

    // The name exists but its index lies beyond the declared fd count.
    std::env::set_var("LISTEN_FDNAMES", "first:control");
    let err = Endpoint::from_inherited("control", true).unwrap_err();
    match err {
        EndpointError::InheritedListener { reason, .. } => {
            assert!(reason.contains("exceeds LISTEN_FDS"), "reason: {reason}");
        }
        other => panic!("expected InheritedListener, got {other:?}"),
    }

    std::env::remove_var("LISTEN_PID");
    std::env::remove_var("LISTEN_FDS");
    std::env::remove_var("LISTEN_FDNAMES");
}

#[test]
fn channel_open_failure_closes_channel() {
    let path = socket_path("open-fail");
    let endpoint = Endpoint::bind(&path, true).unwrap();

    let client_path = path.clone();
    let client = thread::spawn(move || {
        let stream = open_channel(&client_path);
        // No reply comes back; the endpoint just drops the connection.
        recv_response(stream.as_fd())
    });

    let mut message = endpoint.wait().unwrap();
    endpoint.reply(&mut message, -libc::EPERM).unwrap();
    assert_eq!(endpoint.channel_count(), 0);

    let result = client.join().unwrap();
    assert!(matches!(result, Err(WireError::PeerClosed)));

    cleanup(&path);
}

#[test]
fn request_reply_roundtrip() {
    let path = socket_path("echo");
    let endpoint = Endpoint::bind(&path, true).unwrap();

    let client_path = path.clone();
    let client = thread::spawn(move || {
        let stream = connect_retrying(&client_path);
        let header = RequestHeader {
            op: 7,
            max_recv_len: 1024,
            ..RequestHeader::default()
        };
        send_request(stream.as_fd(), &header, b"hello", &[], &[]).unwrap();
        let first = recv_response(stream.as_fd()).unwrap();

        send_request(stream.as_fd(), &header, b"again", &[], &[]).unwrap();
        let second = recv_response(stream.as_fd()).unwrap();
        (first, second)
    });

    let mut first = endpoint.wait().unwrap();
    assert_eq!(first.op(), 7);
    assert_eq!(first.send_len(), 5);
    assert_eq!(first.recv_len(), 1024);
    let mut payload = [0u8; 16];
    let n = first.read_data(&mut payload);
    assert_eq!(&payload[..n], b"hello");
    first.write_data(b"HELLO");
    endpoint.reply(&mut first, 0).unwrap();

    // Replying re-armed the channel; the next request arrives normally.
    let mut second = endpoint.wait().unwrap();
    let n = second.read_data(&mut payload);
    assert_eq!(&payload[..n], b"again");
    second.write_data(b"AGAIN");
    endpoint.reply(&mut second, 3).unwrap();

    // Message ids are monotonically increasing per endpoint.
    assert!(second.message_id() > first.message_id());

    let (first, second) = client.join().unwrap();
    assert_eq!(first.header.ret_code, 0);
    assert_eq!(first.payload, b"HELLO");
    assert_eq!(second.header.ret_code, 3);
    assert_eq!(second.payload, b"AGAIN");

    cleanup(&path);
}

#[test]
fn disconnect_synthesizes_close_message() {
    let path = socket_path("close");
    let endpoint = Endpoint::bind(&path, true).unwrap();

    let client_path = path.clone();
    let client = thread::spawn(move || {
        let stream = open_channel(&client_path);
        let _ = recv_response(stream.as_fd()).unwrap();
        // Returning drops the stream: the peer disconnects.
    });

    let mut message = endpoint.wait().unwrap();
    endpoint.reply(&mut message, 0).unwrap();
    client.join().unwrap();

    // No error reaches the worker; it just sees a close notification.
    let mut close = endpoint.wait().unwrap();
    assert_eq!(close.op(), opcodes::CHANNEL_CLOSE);
    assert_eq!(close.channel_id(), message.channel_id());
    assert_ne!(close.message_id(), IMPULSE_MESSAGE_ID);

    // Replying to the close tears the channel down without writing.
    endpoint.reply(&mut close, 0).unwrap();
    assert_eq!(endpoint.channel_count(), 0);

    cleanup(&path);
}

#[test]
fn truncated_payload_tears_channel_down() {
    let path = socket_path("truncated");
    let endpoint = Endpoint::bind(&path, true).unwrap();

    let client_path = path.clone();
    let client = thread::spawn(move || {
        let stream = connect_retrying(&client_path);
        // Declare 100 payload bytes but deliver only 60, then vanish.
        let header = RequestHeader {
            op: 9,
            send_len: 100,
            ..RequestHeader::default()
        };
        let mut wire = bytes::BytesMut::new();
        header.encode(&mut wire).unwrap();
        send_all(stream.as_fd(), &wire).unwrap();
        send_all(stream.as_fd(), &[0u8; 60]).unwrap();
    });

    let err = endpoint.wait().unwrap_err();
    assert!(matches!(
        err,
        EndpointError::Wire(WireError::Truncated {
            expected: 100,
            got: 60
        })
    ));
    // The transport closed the channel; no message reached the service.
    assert_eq!(endpoint.channel_count(), 0);

    client.join().unwrap();
    cleanup(&path);
}

#[test]
fn impulse_needs_no_reply_and_rearms_immediately() {
    let path = socket_path("impulse");
    let endpoint = Endpoint::bind(&path, true).unwrap();

    let client_path = path.clone();
    let client = thread::spawn(move || {
        let stream = connect_retrying(&client_path);
        let mut impulse_payload = [0u8; IMPULSE_PAYLOAD_SIZE];
        impulse_payload[..6].copy_from_slice(b"inline");
        let header = RequestHeader {
            op: 5,
            is_impulse: true,
            impulse_payload,
            ..RequestHeader::default()
        };
        send_request(stream.as_fd(), &header, b"", &[], &[]).unwrap();

        // Follow up with a normal request on the same channel, with no
        // reply in between.
        let header = RequestHeader {
            op: 6,
            ..RequestHeader::default()
        };
        send_request(stream.as_fd(), &header, b"normal", &[], &[]).unwrap();
        let response = recv_response(stream.as_fd()).unwrap();
        assert_eq!(response.header.ret_code, 0);
    });

    let impulse = endpoint.wait().unwrap();
    assert!(impulse.is_impulse());
    assert_eq!(impulse.message_id(), IMPULSE_MESSAGE_ID);
    assert_eq!(impulse.op(), 5);
    assert_eq!(&impulse.impulse_payload()[..6], b"inline");
    drop(impulse); // Never replied to.

    // The channel was re-armed right after the impulse header: the
    // follow-up request is delivered without any reply having been sent.
    let mut follow_up = endpoint.wait().unwrap();
    assert_eq!(follow_up.op(), 6);
    endpoint.reply(&mut follow_up, 0).unwrap();

    client.join().unwrap();
    cleanup(&path);
}

#[test]
fn cancel_is_observed_by_every_wait() {
    let path = socket_path("cancel");
    let endpoint = Arc::new(Endpoint::bind(&path, true).unwrap());

    let waiter = {
        let endpoint = Arc::clone(&endpoint);
        thread::spawn(move || endpoint.wait())
    };
    thread::sleep(Duration::from_millis(50));
    endpoint.cancel().unwrap();

    let result = waiter.join().unwrap();
    assert!(matches!(result, Err(EndpointError::Shutdown)));

    // Level-triggered: every subsequent wait sees the shutdown too.
    assert!(matches!(endpoint.wait(), Err(EndpointError::Shutdown)));
    assert!(matches!(endpoint.wait(), Err(EndpointError::Shutdown)));

    cleanup(&path);
}

#[test]
fn non_blocking_wait_times_out_without_work() {
    let path = socket_path("nonblocking");
    let endpoint = Endpoint::bind(&path, false).unwrap();
    assert!(!endpoint.is_blocking());
    assert!(matches!(endpoint.wait(), Err(EndpointError::Timeout)));
    cleanup(&path);
}

#[test]
fn file_reference_resolves_to_same_object() {
    let path = socket_path("fd-pass");
    let endpoint = Endpoint::bind(&path, true).unwrap();

    let (carried, kept) = stream_pair().unwrap();
    let client_path = path.clone();
    let client = thread::spawn(move || {
        let stream = connect_retrying(&client_path);
        let header = RequestHeader {
            op: 11,
            ..RequestHeader::default()
        };
        send_request(
            stream.as_fd(),
            &header,
            b"",
            &[carried.as_raw_fd()],
            &[],
        )
        .unwrap();
        drop(carried);
        let _ = recv_response(stream.as_fd()).unwrap();
    });

    let mut message = endpoint.wait().unwrap();
    assert_eq!(message.fd_count(), 1);
    let pulled = message.take_file(0).unwrap().into_fd().unwrap();

    // Writing through the pulled handle reaches the fd's original pair.
    sockmux_wire::send_all(pulled.as_fd(), b"through").unwrap();
    let mut buf = [0u8; 7];
    sockmux_wire::recv_exact(kept.as_fd(), &mut buf).unwrap();
    assert_eq!(&buf, b"through");

    // Out-of-range and sentinel references behave per the protocol.
    assert!(message.take_file(1).is_err());
    assert!(matches!(
        message.take_file(-9).unwrap(),
        sockmux_handle::PulledFd::Sentinel(-9)
    ));

    endpoint.reply(&mut message, 0).unwrap();
    client.join().unwrap();
    cleanup(&path);
}

#[test]
fn push_channel_hands_capability_to_peer() {
    let path = socket_path("push-channel");
    let endpoint = Endpoint::bind(&path, true).unwrap();

    let client_path = path.clone();
    let client = thread::spawn(move || {
        let stream = connect_retrying(&client_path);
        let header = RequestHeader {
            op: 30,
            ..RequestHeader::default()
        };
        send_request(stream.as_fd(), &header, b"", &[], &[]).unwrap();
        let response = recv_response(stream.as_fd()).unwrap();
        assert_eq!(response.channels.len(), 1);
        // The return code is the channel reference.
        assert_eq!(response.header.ret_code, 0);

        // Speak on the freshly granted channel.
        let pair = response.channels.into_iter().next().unwrap();
        let header = RequestHeader {
            op: 31,
            ..RequestHeader::default()
        };
        send_request(pair.socket.as_fd(), &header, b"nested", &[], &[]).unwrap();
        let nested = recv_response(pair.socket.as_fd()).unwrap();
        assert_eq!(nested.payload, b"ok");
    });

    let mut message = endpoint.wait().unwrap();
    assert_eq!(message.op(), 30);
    let service_state: sockmux_endpoint::ServiceState = Arc::new(42u32);
    let (pushed_id, reference) = endpoint
        .push_channel(&mut message, Some(service_state))
        .unwrap();
    endpoint.reply(&mut message, reference).unwrap();
    assert_eq!(endpoint.channel_count(), 2);

    // The peer's first message on the pushed channel arrives like any other.
    let mut nested = endpoint.wait().unwrap();
    assert_eq!(nested.channel_id(), pushed_id);
    assert_eq!(nested.op(), 31);
    let mut buf = [0u8; 6];
    let n = nested.read_data(&mut buf);
    assert_eq!(&buf[..n], b"nested");
    let state = nested.channel_state().expect("state should be attached");
    assert_eq!(*state.downcast::<u32>().unwrap(), 42);
    nested.write_data(b"ok");
    endpoint.reply(&mut nested, 0).unwrap();

    client.join().unwrap();
    cleanup(&path);
}

#[test]
fn attached_state_reaches_later_messages() {
    let path = socket_path("state");
    let endpoint = Endpoint::bind(&path, true).unwrap();

    let client_path = path.clone();
    let client = thread::spawn(move || {
        let stream = open_channel(&client_path);
        let _ = recv_response(stream.as_fd()).unwrap();
        let header = RequestHeader {
            op: 50,
            ..RequestHeader::default()
        };
        send_request(stream.as_fd(), &header, b"", &[], &[]).unwrap();
        let _ = recv_response(stream.as_fd()).unwrap();
    });

    let mut open = endpoint.wait().unwrap();
    assert!(open.channel_state().is_none());
    endpoint
        .set_channel_state(open.channel_id(), Arc::new("session".to_string()))
        .unwrap();
    endpoint.reply(&mut open, 0).unwrap();

    let mut message = endpoint.wait().unwrap();
    let state = message.channel_state().expect("state should be attached");
    assert_eq!(*state.downcast::<String>().unwrap(), "session");
    endpoint.reply(&mut message, 0).unwrap();

    client.join().unwrap();
    cleanup(&path);
}

#[test]
fn unknown_channel_operations_fail_with_invalid_argument() {
    let path = socket_path("unknown");
    let endpoint = Endpoint::bind(&path, true).unwrap();

    assert!(matches!(
        endpoint.close_channel(99),
        Err(EndpointError::UnknownChannel(99))
    ));
    assert!(matches!(
        endpoint.modify_channel_events(99, 0, 1),
        Err(EndpointError::UnknownChannel(99))
    ));
    assert!(matches!(
        endpoint.set_channel_state(99, Arc::new(0u8)),
        Err(EndpointError::UnknownChannel(99))
    ));
    assert!(endpoint.channel_state(99).is_none());
    assert!(endpoint.channel_event(99).is_none());

    cleanup(&path);
}

#[test]
fn worker_pool_handles_channels_without_double_dispatch() {
    let path = socket_path("pool");
    let endpoint = Arc::new(Endpoint::bind(&path, true).unwrap());
    let handled = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let endpoint = Arc::clone(&endpoint);
            let handled = Arc::clone(&handled);
            thread::spawn(move || loop {
                let mut message: Message = match endpoint.wait() {
                    Ok(message) => message,
                    Err(EndpointError::Shutdown) => break,
                    Err(_) => continue,
                };
                if message.op() == opcodes::CHANNEL_CLOSE {
                    let _ = endpoint.reply(&mut message, 0);
                    continue;
                }
                let mut buf = [0u8; 64];
                let n = message.read_data(&mut buf);
                message.write_data(&buf[..n]);
                if endpoint.reply(&mut message, 0).is_ok() {
                    handled.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();

    let clients: Vec<_> = (0..6)
        .map(|client_idx| {
            let path = path.clone();
            thread::spawn(move || {
                let stream = connect_retrying(&path);
                for i in 0..10u32 {
                    let header = RequestHeader {
                        op: 100,
                        ..RequestHeader::default()
                    };
                    let payload = format!("client-{client_idx}-msg-{i}");
                    send_request(stream.as_fd(), &header, payload.as_bytes(), &[], &[]).unwrap();
                    let response = recv_response(stream.as_fd()).unwrap();
                    // Per-channel ordering: each reply answers the request
                    // just sent, even with four workers dispatching.
                    assert_eq!(response.payload, payload.as_bytes());
                }
            })
        })
        .collect();

    for client in clients {
        client.join().unwrap();
    }
    endpoint.cancel().unwrap();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(handled.load(Ordering::SeqCst), 60);
    cleanup(&path);
}

#[test]
fn bind_refuses_existing_non_socket_path() {
    let path = socket_path("bind-file");
    std::fs::write(&path, b"regular-file").unwrap();

    let result = Endpoint::bind(&path, true);
    assert!(matches!(result, Err(EndpointError::Bind { .. })));

    cleanup(&path);
}

#[test]
fn bind_cleans_up_socket_file_on_drop() {
    let path = socket_path("bind-drop");
    let endpoint = Endpoint::bind(&path, true).unwrap();
    assert!(path.exists());
    drop(endpoint);
    assert!(!path.exists(), "socket file should be removed on drop");
    cleanup(&path);
}
