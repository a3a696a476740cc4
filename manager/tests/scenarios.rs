//! End-to-end scenarios driven against a real bound [`ds_manager::Manager`]
//! with a hand-rolled fake worker speaking the wire protocol directly
//! over a loopback `TcpStream` (spec.md §8, "seed tests" 1-2 and a cache
//! invalidation variant of 6). No mocks of the manager itself: these
//! exercise the actual event loop, codec, and scheduler together.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use ds_manager::{Manager, NewTask};
use shared::config::ManagerConfig;

async fn start_manager() -> Manager {
    let config = ManagerConfig {
        port: 0,
        wait_for_workers: 0,
        ..Default::default()
    };
    Manager::new(config).await.expect("manager should bind an ephemeral port")
}

/// Read off the socket until the byte sequence `end\n` terminates a
/// task-start header block (spec.md §4.1's `end` terminator).
async fn read_until_task_header_ends(stream: &mut TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await.expect("worker read should succeed");
        assert!(n > 0, "manager closed the connection before sending a task");
        buf.extend_from_slice(&chunk[..n]);
        if buf.ends_with(b"end\n") {
            return buf;
        }
    }
}

async fn send_greeting(stream: &mut TcpStream, version: u32) {
    stream
        .write_all(format!("dataswarm {version} fake-worker Linux x86_64 1.0\n").as_bytes())
        .await
        .unwrap();
}

async fn send_standard_resources(stream: &mut TcpStream, cores: f64) {
    stream
        .write_all(format!("resource cores {cores} 1 {cores}\n").as_bytes())
        .await
        .unwrap();
    stream.write_all(b"resource memory 8000 1 8000\n").await.unwrap();
    stream.write_all(b"resource disk 10000 1 10000\n").await.unwrap();
    stream.write_all(b"resource gpus 0 0 0\n").await.unwrap();
}

/// Scenario 1 (spec.md §8): submit `/bin/echo hi` with 1 core, one
/// worker connects advertising 4 cores. Expect dispatch, a `result`
/// exchange, and `wait()` returning the task DONE with its stdout
/// captured verbatim.
#[tokio::test]
async fn happy_path_dispatch_and_retrieve() {
    let mut manager = start_manager().await;
    let addr = manager.local_addr();

    let mut task = NewTask::new("/bin/echo hi", "default");
    task.request.cores = Some(1.0);
    let taskid = manager.submit(task);

    let worker = tokio::spawn(async move {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        send_greeting(&mut stream, ds_protocol::PROTOCOL_VERSION).await;
        send_standard_resources(&mut stream, 4.0).await;

        let header = read_until_task_header_ends(&mut stream).await;
        let header_text = String::from_utf8_lossy(&header);
        assert!(header_text.contains(&format!("task {taskid}\n")));
        assert!(header_text.contains("category default\n"));
        assert!(header_text.contains("cores 1\n"));

        let stdout = b"hi\n";
        let result_line = format!("result 0 0 {} 1000 {taskid}\n", stdout.len());
        stream.write_all(result_line.as_bytes()).await.unwrap();
        stream.write_all(stdout).await.unwrap();
        stream.flush().await.unwrap();

        // Keep the socket open long enough for the manager to read the
        // result before the test tears everything down.
        tokio::time::sleep(Duration::from_millis(200)).await;
    });

    let completed = manager
        .wait(Duration::from_secs(5))
        .await
        .expect("task should complete within the timeout");

    assert_eq!(completed.taskid, taskid);
    assert_eq!(completed.output, b"hi\n");
    assert_eq!(completed.exit_code, Some(0));
    assert_eq!(completed.state, ds_manager::task::TaskState::Done);
    assert_eq!(manager.stats().tasks_done, 1);

    worker.await.unwrap();
}

/// Scenario 2 (spec.md §8): a worker greets with the wrong protocol
/// version. Expect it removed immediately, never counted as joined, and
/// its host blocked.
#[tokio::test]
async fn protocol_mismatch_drops_and_blocks_worker() {
    let mut manager = start_manager().await;
    let addr = manager.local_addr();

    let worker = tokio::spawn(async move {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        send_greeting(&mut stream, ds_protocol::PROTOCOL_VERSION + 1).await;
        let mut byte = [0u8; 1];
        // The manager should close the connection rather than reply.
        let n = stream.read(&mut byte).await.unwrap_or(0);
        assert_eq!(n, 0, "manager should close the connection on a version mismatch");
    });

    for _ in 0..20 {
        manager.run_once(Duration::from_millis(50)).await;
        if manager.stats().workers_blocked > 0 {
            break;
        }
    }

    assert_eq!(manager.stats().workers_joined, 0);
    assert_eq!(manager.stats().workers_blocked, 1);
    assert_eq!(manager.worker_count(), 0);

    worker.await.unwrap();
}

/// A worker that disconnects mid-task (spec.md §8 scenario 3): the task
/// returns to READY with its try count bumped, and the worker is
/// removed as a failure rather than politely.
#[tokio::test]
async fn worker_disconnect_mid_task_requeues_it() {
    let mut manager = start_manager().await;
    let addr = manager.local_addr();

    let mut task = NewTask::new("/bin/sleep 5", "default");
    task.request.cores = Some(1.0);
    let taskid = manager.submit(task);

    let worker = tokio::spawn(async move {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        send_greeting(&mut stream, ds_protocol::PROTOCOL_VERSION).await;
        send_standard_resources(&mut stream, 4.0).await;
        let _ = read_until_task_header_ends(&mut stream).await;
        // Drop the connection without ever sending a result.
        drop(stream);
    });
    worker.await.unwrap();

    // Drive the loop until the disconnect is observed and the task is
    // back on the ready queue.
    for _ in 0..50 {
        manager.run_once(Duration::from_millis(20)).await;
        if manager.pending_task_count() == 1 {
            // still tracked; confirm it actually cycled through a retry
        }
    }

    // Re-admit a second worker and let the retried task dispatch again.
    let second = tokio::spawn(async move {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        send_greeting(&mut stream, ds_protocol::PROTOCOL_VERSION).await;
        send_standard_resources(&mut stream, 4.0).await;
        let header = read_until_task_header_ends(&mut stream).await;
        let header_text = String::from_utf8_lossy(&header);
        assert!(header_text.contains(&format!("task {taskid}\n")));

        let stdout = b"";
        let result_line = format!("result 0 0 0 1000 {taskid}\n");
        stream.write_all(result_line.as_bytes()).await.unwrap();
        stream.write_all(stdout).await.unwrap();
        stream.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
    });

    let completed = manager
        .wait(Duration::from_secs(5))
        .await
        .expect("retried task should eventually complete");
    assert_eq!(completed.taskid, taskid);
    assert_eq!(completed.try_count, 1, "one retry should have been charged");

    second.await.unwrap();
}

/// A task that keeps failing its worker never retries past `max_retries`
/// and surfaces as MAX_RETRIES instead of cycling through the ready
/// queue forever (spec.md §4.8).
#[tokio::test]
async fn exhausted_retries_surface_max_retries() {
    let mut manager = start_manager().await;
    let addr = manager.local_addr();

    let mut task = NewTask::new("/bin/false", "default");
    task.request.cores = Some(1.0);
    task.max_retries = 1;
    let taskid = manager.submit(task);

    // Each worker connects just long enough to receive the task header,
    // then disconnects without ever sending a result -- a worker failure
    // that forces a retry.
    for _ in 0..2 {
        let worker = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            send_greeting(&mut stream, ds_protocol::PROTOCOL_VERSION).await;
            send_standard_resources(&mut stream, 4.0).await;
            let _ = read_until_task_header_ends(&mut stream).await;
            drop(stream);
        });
        worker.await.unwrap();

        for _ in 0..50 {
            manager.run_once(Duration::from_millis(20)).await;
        }
    }

    let completed = manager
        .wait(Duration::from_secs(5))
        .await
        .expect("task should surface once its retry budget is exhausted");
    assert_eq!(completed.taskid, taskid);
    assert_eq!(completed.state, ds_manager::task::TaskState::Retrieved);
    assert_eq!(completed.result, Some(ds_manager::task::ResultCode::MaxRetries));
}

/// A task whose declared start time is in the future never dispatches to
/// an otherwise-idle worker until that time arrives (spec.md §4.4).
#[tokio::test]
async fn task_waits_for_its_declared_start_time() {
    let mut manager = start_manager().await;
    let addr = manager.local_addr();

    let mut task = NewTask::new("/bin/true", "default");
    task.request.cores = Some(1.0);
    task.request.start = Some(u64::MAX); // never arrives within this test
    manager.submit(task);

    let worker = tokio::spawn(async move {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        send_greeting(&mut stream, ds_protocol::PROTOCOL_VERSION).await;
        send_standard_resources(&mut stream, 4.0).await;
        // The manager should never send a task header; hold the
        // connection open for the probe window below.
        tokio::time::sleep(Duration::from_millis(300)).await;
    });

    for _ in 0..10 {
        manager.run_once(Duration::from_millis(20)).await;
    }
    assert_eq!(manager.pending_task_count(), 1, "task should still be waiting for its start time");

    worker.await.unwrap();
}

/// A task whose declared `end` deadline has already passed is expired
/// out of the ready queue as TASK_TIMEOUT rather than waiting for a
/// worker that will never get there in time (spec.md §4.8).
#[tokio::test]
async fn ready_task_past_its_deadline_times_out() {
    let mut manager = start_manager().await;

    let mut task = NewTask::new("/bin/true", "default");
    task.request.cores = Some(1.0);
    task.request.end = Some(1); // 1 second past the epoch: already expired
    manager.submit(task);

    let completed = manager
        .wait(Duration::from_secs(5))
        .await
        .expect("expired task should be returned without ever dispatching");
    assert_eq!(completed.state, ds_manager::task::TaskState::Retrieved);
    assert_eq!(completed.result, Some(ds_manager::task::ResultCode::TaskTimeout));
}

/// Scenario 6 (spec.md §8): a cached file is shared by two workers and a
/// running task depends on it as an input. Invalidating it requeues the
/// task and issues `unlink` to every worker holding the name, not just
/// the one that reported the invalidation.
#[tokio::test]
async fn cache_invalidation_requeues_dependent_task_and_unlinks_everywhere() {
    let mut manager = start_manager().await;
    let addr = manager.local_addr();

    let mut task = NewTask::new("/bin/cat f.dat", "default");
    task.request.cores = Some(1.0);
    task.input_files.push(ds_manager::task::TaskFile {
        local_name: "f.dat".into(),
        remote_name: "f.dat".into(),
        cached_name: "F".into(),
        is_directory: false,
        cacheable: true,
        flags: 0,
    });
    let taskid = manager.submit(task);

    let bystander = tokio::spawn(async move {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        send_greeting(&mut stream, ds_protocol::PROTOCOL_VERSION).await;
        // No spare cores: never a dispatch candidate, only a cache holder.
        send_standard_resources(&mut stream, 0.0).await;
        stream.write_all(b"cache-update F 100 10\n").await.unwrap();
        stream.flush().await.unwrap();

        let mut buf = Vec::new();
        let mut chunk = [0u8; 256];
        loop {
            let n = stream.read(&mut chunk).await.expect("bystander read should succeed");
            assert!(n > 0, "manager closed bystander connection unexpectedly");
            buf.extend_from_slice(&chunk[..n]);
            if buf.windows(b"unlink F\n".len()).any(|w| w == b"unlink F\n") {
                break;
            }
        }
    });

    let holder = tokio::spawn(async move {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        send_greeting(&mut stream, ds_protocol::PROTOCOL_VERSION).await;
        send_standard_resources(&mut stream, 4.0).await;
        stream.write_all(b"cache-update F 100 10\n").await.unwrap();
        stream.flush().await.unwrap();

        let header = read_until_task_header_ends(&mut stream).await;
        assert!(String::from_utf8_lossy(&header).contains(&format!("task {taskid}\n")));

        let reason = b"no longer valid";
        stream
            .write_all(format!("cache-invalid F {}\n", reason.len()).as_bytes())
            .await
            .unwrap();
        stream.write_all(reason).await.unwrap();
        stream.flush().await.unwrap();

        // Stay connected long enough to receive the `kill`/`unlink` the
        // manager sends back in response.
        tokio::time::sleep(Duration::from_millis(300)).await;
    });

    for _ in 0..100 {
        manager.run_once(Duration::from_millis(20)).await;
        if manager.task_snapshot(taskid).map(|(_, tries)| tries).unwrap_or(0) >= 1 {
            break;
        }
    }

    let (state, try_count) = manager
        .task_snapshot(taskid)
        .expect("task should still be owned by the manager, not yet retrieved");
    assert!(try_count >= 1, "dependent task should have been requeued at least once");
    assert_ne!(state, ds_manager::task::TaskState::Done);

    bystander.await.unwrap();
    holder.await.unwrap();
}

/// Canceling a READY task (never dispatched) transitions it to CANCELED
/// immediately and it is returned by the next `wait()` (spec.md §8
/// invariant 5).
#[tokio::test]
async fn cancel_ready_task_is_immediate() {
    let mut manager = start_manager().await;
    let taskid = manager.submit(NewTask::new("/bin/true", "default"));

    assert!(manager.cancel_by_taskid(taskid));

    let completed = manager
        .wait(Duration::from_secs(1))
        .await
        .expect("canceled task should be returned without any worker");
    assert_eq!(completed.taskid, taskid);
    assert_eq!(completed.state, ds_manager::task::TaskState::Canceled);
}
