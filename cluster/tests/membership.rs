mod common;

use common::*;

use cluster::agent::{ModuleState, Role};
use cluster::codec::peer::PeerMessage;

#[test]
fn dynamic_member_joins_and_catches_up() {
    let mut cluster = TestCluster::new(3, 0);
    cluster.start();
    let leader = cluster.await_leader();
    cluster.run_until("followers settle", |cluster| {
        cluster.running_members().all(|m| !m.agent.in_election())
    });

    let mut client = TestClient::new(&cluster, "join");
    client.connect(0);
    run_client_until(&mut cluster, &mut client, |client| client.connected);
    send_messages(&mut cluster, &mut client, 0, 5);
    cluster.run_until("baseline committed", |cluster| {
        cluster
            .running_members()
            .all(|member| member.service_message_count() == 5)
    });

    let joiner = cluster.add_dynamic_member();
    cluster.run_until("joiner admitted", |cluster| {
        let member = cluster.member(joiner);
        member.agent.role() == Role::Follower
            && member.agent.state() == ModuleState::Active
            && !member.agent.in_election()
            && member.agent.active_member_count() == 4
    });

    assert_eq!(cluster.member(joiner).agent.member_id(), 3);
    cluster.run_until("joiner reaches committed log", |cluster| {
        cluster.member(joiner).commit_position.get()
            >= cluster.member(leader).commit_position.get()
            && cluster.member(joiner).service_message_count() == 5
    });

    cluster.run_until("leader registers four members", |cluster| {
        cluster.member(leader).agent.active_member_count() == 4
    });

    // The enlarged cluster still replicates.
    send_messages(&mut cluster, &mut client, 5, 3);
    cluster.run_until("new messages everywhere", |cluster| {
        cluster
            .running_members()
            .all(|member| member.service_message_count() == 8)
    });
}

#[test]
fn removed_member_leaves_and_closes() {
    let mut cluster = TestCluster::new(3, 0);
    cluster.start();
    let leader = cluster.await_leader();
    cluster.run_until("followers settle", |cluster| {
        cluster.running_members().all(|m| !m.agent.in_election())
    });
    let removed = (0..3).find(|i| *i != leader).unwrap();

    send_peer_message(
        &cluster,
        leader as i32,
        &PeerMessage::RemoveMember {
            correlation_id: 1,
            member_id: removed as i32,
            is_passive: false,
        },
    );

    cluster.run_until("membership shrinks on leader", |cluster| {
        cluster.member(leader).agent.active_member_count() == 2
    });
    cluster.run_until("removed member leaves", |cluster| {
        cluster.member(removed).state() == ModuleState::Closed
    });

    // The shrunken cluster still has a working quorum.
    let mut client = TestClient::new(&cluster, "after-removal");
    client.connect(leader as i32);
    run_client_until(&mut cluster, &mut client, |client| client.connected);
    send_messages(&mut cluster, &mut client, 0, 2);
    cluster.run_until("messages after removal", |cluster| {
        cluster
            .members
            .iter()
            .enumerate()
            .filter(|(index, _)| *index != removed)
            .filter_map(|(_, member)| member.as_ref())
            .all(|member| member.service_message_count() == 2)
    });
}
