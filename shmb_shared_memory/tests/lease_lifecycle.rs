//! Lease lifecycle tests against an in-process broker

use shmb::protocol::{Command, attach_request, create_request, read_byte, read_string};
use shmb_shared_memory::platform::{Ownership, ShmObject, segment_exists};
use shmb_shared_memory::{
    BrokerServer, Context, RegistryHandle, ShmError, ShmResult, ShutdownHandle, TeardownReport,
    shutdown_server,
};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

struct TestBroker {
    address: SocketAddr,
    registry: RegistryHandle,
    shutdown: ShutdownHandle,
    task: JoinHandle<ShmResult<TeardownReport>>,
}

async fn start_broker() -> TestBroker {
    let server = BrokerServer::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    TestBroker {
        address: server.local_addr().unwrap(),
        registry: server.registry(),
        shutdown: server.shutdown_handle(),
        task: tokio::spawn(server.serve()),
    }
}

async fn wait_for_lease_count(registry: &RegistryHandle, name: &str, expected: Option<usize>) {
    for _ in 0..500 {
        if registry.lease_count(name).await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("lease count of {name} never became {expected:?}");
}

#[tokio::test]
async fn test_end_to_end_two_clients() -> ShmResult<()> {
    let broker = start_broker().await;

    let mut a = Context::create_at(broker.address, 4, 1040).await?;
    assert_eq!(a.num_buffers(), 4);
    assert_eq!(a.buf_size(), 1040);
    assert_eq!(a.size(), 1024);
    a.buffer(2)?.fill(0xAB);

    let b = Context::attach_at(broker.address, a.name()).await?;
    assert_eq!(b.name(), a.name());
    {
        let view = b.buffer_readonly(2)?;
        assert_eq!(view.len(), 1024);
        assert!(view.iter().all(|&x| x == 0xAB));
    }
    assert_eq!(broker.registry.lease_count(a.name()).await, Some(2));

    let name = a.name().to_string();
    a.close();
    a.wait_closed().await;
    assert!(a.is_closed());
    wait_for_lease_count(&broker.registry, &name, Some(1)).await;

    assert!(segment_exists(&name));
    assert!(b.buffer_readonly(2)?.iter().all(|&x| x == 0xAB));

    drop(b);
    wait_for_lease_count(&broker.registry, &name, None).await;
    assert!(!segment_exists(&name));

    let err = Context::attach_at(broker.address, &name).await.unwrap_err();
    assert!(err.is_invalid_name(), "unexpected error: {err}");

    broker.shutdown.trigger();
    assert_eq!(broker.task.await.unwrap()?, TeardownReport::default());
    Ok(())
}

#[tokio::test]
async fn test_buffers_do_not_overlap() -> ShmResult<()> {
    let broker = start_broker().await;
    let mut ctx = Context::create_at(broker.address, 8, 48).await?;

    for i in 0..ctx.num_buffers() {
        ctx.buffer(i)?.fill(i as u8 + 1);
    }
    for i in 0..ctx.num_buffers() {
        let view = ctx.buffer_readonly(i)?;
        assert_eq!(view.len(), 32);
        assert!(view.iter().all(|&x| x == i as u8 + 1));
    }

    // Header and reserved prefixes stay untouched.
    let raw = ShmObject::open(ctx.name(), Ownership::Borrowed)?;
    let bytes = raw.as_slice();
    assert_eq!(&bytes[..8], &8u64.to_le_bytes());
    assert_eq!(&bytes[8..16], &48u64.to_le_bytes());
    for i in 0..8 {
        let prefix = 16 + i * 48;
        assert!(bytes[prefix..prefix + 16].iter().all(|&x| x == 0));
    }
    Ok(())
}

#[tokio::test]
async fn test_index_out_of_range() -> ShmResult<()> {
    let broker = start_broker().await;
    let mut ctx = Context::create_at(broker.address, 2, 64).await?;

    assert!(matches!(
        ctx.buffer_readonly(2),
        Err(ShmError::IndexOutOfRange {
            index: 2,
            num_buffers: 2
        })
    ));
    assert!(matches!(
        ctx.buffer(usize::MAX),
        Err(ShmError::IndexOutOfRange { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn test_buffer_error_after_close() -> ShmResult<()> {
    let broker = start_broker().await;
    let mut ctx = Context::create_at(broker.address, 1, 64).await?;

    ctx.close();
    assert!(matches!(ctx.buffer(0), Err(ShmError::BufferError { .. })));
    assert!(matches!(
        ctx.buffer_readonly(0),
        Err(ShmError::BufferError { .. })
    ));

    // Closing twice and waiting twice are both fine.
    ctx.close();
    ctx.wait_closed().await;
    ctx.wait_closed().await;
    Ok(())
}

#[tokio::test]
async fn test_dropping_context_releases_lease() -> ShmResult<()> {
    let broker = start_broker().await;
    let ctx = Context::create_default_at(broker.address, 2).await?;
    assert_eq!(ctx.size(), 65536 - 16);

    let name = ctx.name().to_string();
    drop(ctx);
    wait_for_lease_count(&broker.registry, &name, None).await;
    assert!(!segment_exists(&name));
    Ok(())
}

#[tokio::test]
async fn test_severed_connection_releases_lease() {
    let broker = start_broker().await;

    let mut stream = TcpStream::connect(broker.address).await.unwrap();
    stream.write_all(&create_request(2, 64)).await.unwrap();
    assert_eq!(
        read_byte(&mut stream).await.unwrap(),
        Some(Command::Complete.as_byte())
    );
    let name = read_string(&mut stream).await.unwrap();
    assert!(broker.registry.contains(&name).await);

    let mut peer = TcpStream::connect(broker.address).await.unwrap();
    peer.write_all(&attach_request(&name)).await.unwrap();
    assert_eq!(
        read_byte(&mut peer).await.unwrap(),
        Some(Command::Complete.as_byte())
    );
    assert_eq!(read_string(&mut peer).await.unwrap(), name);
    assert_eq!(broker.registry.lease_count(&name).await, Some(2));

    drop(stream);
    wait_for_lease_count(&broker.registry, &name, Some(1)).await;
    drop(peer);
    wait_for_lease_count(&broker.registry, &name, None).await;
    assert!(!segment_exists(&name));
}

#[tokio::test]
#[allow(deprecated)]
async fn test_reset_connection_releases_lease() {
    let broker = start_broker().await;

    let mut stream = TcpStream::connect(broker.address).await.unwrap();
    stream.write_all(&create_request(1, 64)).await.unwrap();
    assert_eq!(
        read_byte(&mut stream).await.unwrap(),
        Some(Command::Complete.as_byte())
    );
    let name = read_string(&mut stream).await.unwrap();
    assert_eq!(broker.registry.lease_count(&name).await, Some(1));

    // Zero linger turns the close into an RST instead of a FIN.
    stream.set_linger(Some(Duration::ZERO)).unwrap();
    drop(stream);

    wait_for_lease_count(&broker.registry, &name, None).await;
    assert!(!segment_exists(&name));
}

#[tokio::test]
async fn test_killed_client_process_releases_lease() {
    let broker = start_broker().await;

    // A shell holding a create request open on fd 3, never reading the reply.
    let script = format!(
        "exec 3<>/dev/tcp/{}/{}; printf '\\001\\001\\0\\0\\0\\0\\0\\0\\0\\100\\0\\0\\0\\0\\0\\0\\0' >&3; exec sleep 60",
        broker.address.ip(),
        broker.address.port()
    );
    let mut client = std::process::Command::new("bash")
        .arg("-c")
        .arg(script)
        .spawn()
        .unwrap();

    let mut names = Vec::new();
    for _ in 0..500 {
        names = broker.registry.segment_names().await;
        if !names.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(names.len(), 1, "client never obtained a lease");
    let name = names.remove(0);
    assert!(segment_exists(&name));

    client.kill().unwrap();
    client.wait().unwrap();

    wait_for_lease_count(&broker.registry, &name, None).await;
    assert!(!segment_exists(&name));
}

#[tokio::test]
async fn test_held_view_does_not_block_teardown() -> ShmResult<()> {
    let broker = start_broker().await;
    let mut ctx = Context::create_at(broker.address, 2, 64).await?;
    ctx.buffer(1)?.fill(0x5A);

    let view = ctx.buffer_readonly(1)?;
    broker.shutdown.trigger();
    broker.task.await.unwrap()?;

    // The monitor runs on this thread and must yield while the view lives.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!ctx.is_closed());
    assert!(view.iter().all(|&x| x == 0x5A));
    drop(view);

    tokio::time::timeout(Duration::from_secs(5), ctx.wait_closed())
        .await
        .expect("monitor should unmap once the view is dropped");
    assert!(ctx.is_closed());
    assert!(matches!(
        ctx.buffer_readonly(1),
        Err(ShmError::BufferError { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn test_invalid_layout_is_refused() {
    let broker = start_broker().await;

    for (num_buffers, buf_size) in [(0, 64), (4, 16), (u64::MAX, u64::MAX)] {
        let mut stream = TcpStream::connect(broker.address).await.unwrap();
        stream
            .write_all(&create_request(num_buffers, buf_size))
            .await
            .unwrap();
        assert_eq!(read_byte(&mut stream).await.unwrap(), None);
    }
    assert!(broker.registry.segment_names().await.is_empty());

    assert!(matches!(
        Context::create_at(broker.address, 0, 64).await,
        Err(ShmError::InvalidLayout { .. })
    ));
}

#[tokio::test]
async fn test_attach_unknown_name() {
    let broker = start_broker().await;
    let err = Context::attach_at(broker.address, "shmb_no_such_segment")
        .await
        .unwrap_err();
    assert!(err.is_invalid_name());
}

#[tokio::test]
async fn test_no_broker_is_connection_refused() {
    let address = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    assert!(matches!(
        Context::create_at(address, 1, 64).await,
        Err(ShmError::ConnectionRefused { .. })
    ));
    assert!(matches!(
        Context::attach_at(address, "shmb_x").await,
        Err(ShmError::ConnectionRefused { .. })
    ));
}

#[tokio::test]
async fn test_shutdown_command_tears_down_everything() -> ShmResult<()> {
    let broker = start_broker().await;

    let mut a = Context::create_at(broker.address, 2, 64).await?;
    let b = Context::create_at(broker.address, 1, 32).await?;
    let c = Context::attach_at(broker.address, b.name()).await?;
    let names = [a.name().to_string(), b.name().to_string()];

    shutdown_server(broker.address).await?;
    let report = broker.task.await.unwrap()?;
    assert_eq!(report, TeardownReport { segments: 2, leases: 3 });
    assert!(broker.shutdown.is_triggered());

    for ctx in [&a, &b, &c] {
        tokio::time::timeout(Duration::from_secs(5), ctx.wait_closed())
            .await
            .expect("monitor did not notice broker teardown");
        assert!(ctx.is_closed());
    }
    assert!(matches!(a.buffer(0), Err(ShmError::BufferError { .. })));
    for name in &names {
        assert!(!segment_exists(name));
    }

    assert!(matches!(
        Context::create_at(broker.address, 1, 64).await,
        Err(ShmError::ConnectionRefused { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn test_unknown_command_closes_connection() {
    let broker = start_broker().await;
    let mut stream = TcpStream::connect(broker.address).await.unwrap();
    stream.write_all(&[0x7F]).await.unwrap();
    assert_eq!(read_byte(&mut stream).await.unwrap(), None);
    assert!(!broker.shutdown.is_triggered());
}
