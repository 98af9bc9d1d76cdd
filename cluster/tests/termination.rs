mod common;

use common::*;

use cluster::agent::ModuleState;
use cluster::config::ToggleState;

#[test]
fn abort_terminates_every_member() {
    let mut cluster = TestCluster::new(3, 0);
    cluster.start();
    let leader = cluster.await_leader();
    cluster.run_until("followers settle", |cluster| {
        cluster.running_members().all(|m| !m.agent.in_election())
    });

    let mut client = TestClient::new(&cluster, "abort");
    client.connect(0);
    run_client_until(&mut cluster, &mut client, |client| client.connected);
    send_messages(&mut cluster, &mut client, 0, 3);
    cluster.run_until("steady state", |cluster| {
        cluster
            .running_members()
            .all(|member| member.service_message_count() == 3)
    });

    cluster.set_control_toggle(leader, ToggleState::Abort);
    let deadline = cluster.time_ms + TERMINATION_TIMEOUT_MS + 100;
    cluster.run_until("all members closed", |cluster| {
        cluster
            .running_members()
            .all(|member| member.state() == ModuleState::Closed)
    });
    assert!(cluster.time_ms <= deadline, "termination exceeded its timeout");

    for member in cluster.running_members() {
        assert!(member.service.lock().unwrap().terminated, "service told to halt");
        // Abort terminates without a snapshot.
        assert_eq!(member.snapshot_counter.get(), 0);
    }
}

#[test]
fn shutdown_snapshots_then_terminates() {
    let mut cluster = TestCluster::new(3, 0);
    cluster.start();
    let leader = cluster.await_leader();
    cluster.run_until("followers settle", |cluster| {
        cluster.running_members().all(|m| !m.agent.in_election())
    });

    cluster.set_control_toggle(leader, ToggleState::Shutdown);
    cluster.run_until("all members closed", |cluster| {
        cluster
            .running_members()
            .all(|member| member.state() == ModuleState::Closed)
    });

    for member in cluster.running_members() {
        assert!(member.snapshot_counter.get() >= 1, "shutdown snapshots first");
        assert!(member.service.lock().unwrap().terminated);
    }
}

#[test]
fn leader_terminates_alone_after_ack_timeout() {
    let mut cluster = TestCluster::new(3, 0);
    cluster.start();
    let leader = cluster.await_leader();
    cluster.run_until("followers settle", |cluster| {
        cluster.running_members().all(|m| !m.agent.in_election())
    });

    // Unreachable followers cannot ack; the leader falls back to the
    // termination timeout.
    let followers: Vec<usize> = (0..3).filter(|i| *i != leader).collect();
    for follower in &followers {
        cluster.stop_member(*follower);
    }

    cluster.set_control_toggle(leader, ToggleState::Abort);
    cluster.run_until("leader closed by deadline", |cluster| {
        cluster.member(leader).state() == ModuleState::Closed
    });
}
