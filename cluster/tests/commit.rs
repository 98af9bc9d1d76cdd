mod common;

use common::*;

use itertools::Itertools;
use stream::aligned_frame_length;

#[test]
fn three_member_happy_path() {
    let mut cluster = TestCluster::new(3, 0);
    cluster.start();
    let leader = cluster.await_leader();
    assert_eq!(leader, 0);
    cluster.run_until("followers settle", |cluster| {
        cluster.running_members().all(|m| !m.agent.in_election())
    });

    let mut client = TestClient::new(&cluster, "happy");
    client.connect(0);
    run_client_until(&mut cluster, &mut client, |client| client.connected);

    send_messages(&mut cluster, &mut client, 0, 100);
    cluster.run_until("all 100 delivered everywhere", |cluster| {
        cluster
            .running_members()
            .all(|member| member.service_message_count() == 100)
    });

    let expected = (0u32..100).map(|i| i.to_le_bytes().to_vec()).collect_vec();
    for member in cluster.running_members() {
        assert_eq!(member.service_messages(), expected, "in-order delivery");
    }

    // Commit advanced at least by the aligned frames of the payloads.
    let floor = 100 * aligned_frame_length(4) as i64;
    assert!(
        cluster.member(leader).commit_position.get() >= floor,
        "commit {} below floor {}",
        cluster.member(leader).commit_position.get(),
        floor
    );
}

#[test]
fn commit_positions_monotone_and_bounded_by_leader() {
    let mut cluster = TestCluster::new(3, 0);
    cluster.start();
    let leader = cluster.await_leader();

    let mut client = TestClient::new(&cluster, "bounds");
    client.connect(0);
    run_client_until(&mut cluster, &mut client, |client| client.connected);
    send_messages(&mut cluster, &mut client, 0, 20);

    let mut last_commits = vec![0i64; 3];
    for _ in 0..500 {
        cluster.tick();
        let leader_commit = cluster.member(leader).commit_position.get();
        for (index, member) in cluster.members.iter().enumerate() {
            let Some(member) = member else { continue };
            let commit = member.commit_position.get();
            assert!(commit >= last_commits[index], "commit went backwards");
            assert!(commit <= leader_commit, "follower commit beyond leader");
            last_commits[index] = commit;
        }
    }
}

#[test]
fn service_messages_replicate_in_order() {
    let mut cluster = TestCluster::new(3, 0);
    cluster.start();
    let leader = cluster.await_leader();
    cluster.run_until("followers settle", |cluster| {
        cluster.running_members().all(|m| !m.agent.in_election())
    });

    {
        let service = cluster.member(leader).service.clone();
        let mut service = service.lock().unwrap();
        assert!(service.send_service_message(b"first"));
        assert!(service.send_service_message(b"second"));
        assert!(service.send_service_message(b"third"));
    }

    cluster.run_until("service messages delivered", |cluster| {
        cluster
            .running_members()
            .all(|member| member.service_message_count() == 3)
    });

    let expected = vec![b"first".to_vec(), b"second".to_vec(), b"third".to_vec()];
    for member in cluster.running_members() {
        assert_eq!(member.service_messages(), expected);
    }
}

#[test]
fn follower_service_messages_reach_log_through_leader() {
    let mut cluster = TestCluster::new(3, 0);
    cluster.start();
    let leader = cluster.await_leader();
    cluster.run_until("followers settle", |cluster| {
        cluster.running_members().all(|m| !m.agent.in_election())
    });
    let follower = (0..3).find(|i| *i != leader).unwrap();

    // A follower-originated service message rides the follower's pending
    // ring until the leader appends its own copy; the sweeper then drops it.
    {
        let service = cluster.member(follower).service.clone();
        service.lock().unwrap().send_service_message(b"from-follower");
    }
    {
        let service = cluster.member(leader).service.clone();
        service.lock().unwrap().send_service_message(b"from-leader");
    }

    cluster.run_until("leader copy replicated", |cluster| {
        cluster
            .running_members()
            .all(|member| member.service_message_count() >= 1)
    });

    let reference = cluster.member(leader).service_messages();
    for member in cluster.running_members() {
        assert_eq!(member.service_messages(), reference);
    }
}
