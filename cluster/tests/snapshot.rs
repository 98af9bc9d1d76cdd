mod common;

use common::*;

use cluster::agent::ModuleState;
use cluster::config::ToggleState;

#[test]
fn snapshot_and_restart_skips_replay() {
    let mut cluster = TestCluster::new(3, 0);
    cluster.start();
    let leader = cluster.await_leader();
    cluster.run_until("followers settle", |cluster| {
        cluster.running_members().all(|m| !m.agent.in_election())
    });

    let mut client = TestClient::new(&cluster, "snap");
    client.connect(0);
    run_client_until(&mut cluster, &mut client, |client| client.connected);
    send_messages(&mut cluster, &mut client, 0, 5);
    cluster.run_until("messages everywhere", |cluster| {
        cluster
            .running_members()
            .all(|member| member.service_message_count() == 5)
    });

    cluster.set_control_toggle(leader, ToggleState::Snapshot);
    cluster.run_until("snapshot on every member", |cluster| {
        cluster
            .running_members()
            .all(|member| member.snapshot_counter.get() >= 1)
    });
    cluster.run_until("cluster active again", |cluster| {
        cluster
            .running_members()
            .all(|member| member.state() == ModuleState::Active)
    });

    cluster.stop_all();
    cluster.run_for(10);
    cluster.restart_all();
    cluster.await_leader();
    cluster.run_until("restarted members settle", |cluster| {
        cluster.running_members().all(|m| !m.agent.in_election())
    });

    for member in cluster.running_members() {
        let service = member.service.lock().unwrap();
        assert!(service.was_snapshot_loaded, "service restored from snapshot");
        assert_eq!(service.messages.len(), 5, "no replay beyond the snapshot");
    }

    // The old client learns of the restarted leader and can keep sending.
    run_client_until(&mut cluster, &mut client, |client| {
        client.new_leader_count > 0
    });
    send_messages(&mut cluster, &mut client, 5, 1);
    cluster.run_until("post-restart message applied", |cluster| {
        cluster
            .running_members()
            .all(|member| member.service_message_count() == 6)
    });
}

#[test]
fn suspend_and_resume_round_trip() {
    let mut cluster = TestCluster::new(3, 0);
    cluster.start();
    let leader = cluster.await_leader();
    cluster.run_until("followers settle", |cluster| {
        cluster.running_members().all(|m| !m.agent.in_election())
    });

    cluster.set_control_toggle(leader, ToggleState::Suspend);
    cluster.run_until("all suspended", |cluster| {
        cluster
            .running_members()
            .all(|member| member.state() == ModuleState::Suspended)
    });

    cluster.set_control_toggle(leader, ToggleState::Resume);
    cluster.run_until("all active", |cluster| {
        cluster
            .running_members()
            .all(|member| member.state() == ModuleState::Active)
    });
}
