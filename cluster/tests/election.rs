mod common;

use common::*;

use cluster::agent::{ModuleState, Role};

#[test]
fn single_member_elects_itself() {
    let mut cluster = TestCluster::new(1, 0);
    cluster.start();
    let leader = cluster.await_leader();
    assert_eq!(leader, 0);
    assert_eq!(cluster.member(0).agent.role(), Role::Leader);
    assert_eq!(cluster.member(0).agent.leadership_term_id(), 0);
}

#[test]
fn appointed_leader_wins_cold_start() {
    let mut cluster = TestCluster::new(3, 0);
    cluster.start();
    let leader = cluster.await_leader();
    assert_eq!(leader, 0);

    cluster.run_until("followers settle", |cluster| {
        cluster
            .running_members()
            .all(|member| member.state() == ModuleState::Active && !member.agent.in_election())
    });

    for index in 1..3 {
        assert_eq!(cluster.member(index).agent.role(), Role::Follower);
        assert_eq!(cluster.member(index).agent.leader_member_id(), 0);
    }
}

#[test]
fn leader_failover_elects_remaining_member() {
    let mut cluster = TestCluster::new(3, 0);
    cluster.start();
    cluster.await_leader();
    cluster.run_until("followers settle", |cluster| {
        cluster.running_members().all(|m| !m.agent.in_election())
    });

    let mut client = TestClient::new(&cluster, "failover");
    client.connect(0);
    run_client_until(&mut cluster, &mut client, |client| client.connected);

    send_messages(&mut cluster, &mut client, 0, 10);
    cluster.run_until("messages on followers", |cluster| {
        cluster
            .running_members()
            .all(|member| member.service_message_count() == 10)
    });

    let term_before = cluster.member(1).agent.leadership_term_id();
    cluster.stop_member(0);

    let mut ticks = 0;
    loop {
        cluster.tick();
        client.poll();
        ticks += 1;
        assert!(ticks < MAX_TICKS, "no failover leader");
        if cluster.has_settled_leader() && client.new_leader_count > 0 {
            break;
        }
    }

    let new_leader = cluster.leader_index().unwrap();
    assert!(new_leader == 1 || new_leader == 2);
    assert_eq!(client.new_leader_count, 1, "exactly one new-leader event");
    assert!(cluster.member(new_leader).agent.leadership_term_id() > term_before);

    send_messages(&mut cluster, &mut client, 10, 10);
    cluster.run_until("messages after failover", |cluster| {
        cluster
            .running_members()
            .all(|member| member.service_message_count() == 20)
    });

    // Identical prefixes on every surviving member.
    let reference = cluster.member(new_leader).service_messages();
    for member in cluster.running_members() {
        assert_eq!(member.service_messages(), reference);
    }
}

#[test]
fn leadership_term_never_decreases() {
    let mut cluster = TestCluster::new(3, 0);
    cluster.start();
    cluster.await_leader();
    cluster.run_until("settled", |cluster| {
        cluster.running_members().all(|m| !m.agent.in_election())
    });

    let mut max_terms = vec![i64::MIN; 3];
    let observe = |cluster: &TestCluster, max_terms: &mut Vec<i64>| {
        for (index, member) in cluster.members.iter().enumerate() {
            if let Some(member) = member {
                let term = member.agent.leadership_term_id();
                assert!(
                    term >= max_terms[index],
                    "term decreased on member {}",
                    index
                );
                max_terms[index] = max_terms[index].max(term);
            }
        }
    };

    observe(&cluster, &mut max_terms);
    cluster.stop_member(0);
    for _ in 0..2_000 {
        cluster.tick();
        observe(&cluster, &mut max_terms);
    }
    assert!(cluster.has_settled_leader());
}
