mod common;

use common::*;

#[test]
fn silent_session_times_out_with_close_in_log() {
    let mut cluster = TestCluster::new(3, 0);
    cluster.start();
    let leader = cluster.await_leader();
    cluster.run_until("followers settle", |cluster| {
        cluster.running_members().all(|m| !m.agent.in_election())
    });

    let mut client = TestClient::new(&cluster, "silent");
    client.connect(0);
    run_client_until(&mut cluster, &mut client, |client| client.connected);
    assert_eq!(cluster.member(leader).agent.open_session_count(), 1);

    // Go silent past the session timeout.
    cluster.run_for(SESSION_TIMEOUT_MS + 50);

    cluster.run_until("session closed on leader", |cluster| {
        cluster.member(leader).agent.open_session_count() == 0
    });
    assert_eq!(cluster.member(leader).timed_out_clients.get(), 1);

    // The replicated close removed the session on followers too.
    cluster.run_until("close replicated", |cluster| {
        cluster
            .running_members()
            .all(|member| member.agent.open_session_count() == 0)
    });
}

#[test]
fn keep_alive_holds_session_open() {
    let mut cluster = TestCluster::new(3, 0);
    cluster.start();
    let leader = cluster.await_leader();
    cluster.run_until("followers settle", |cluster| {
        cluster.running_members().all(|m| !m.agent.in_election())
    });

    let mut client = TestClient::new(&cluster, "keepalive");
    client.connect(0);
    run_client_until(&mut cluster, &mut client, |client| client.connected);

    for _ in 0..(3 * SESSION_TIMEOUT_MS / 100) {
        client.keep_alive();
        cluster.run_for(100);
    }
    assert_eq!(cluster.member(leader).agent.open_session_count(), 1);
    assert_eq!(cluster.member(leader).timed_out_clients.get(), 0);
}

#[test]
fn connect_to_follower_is_redirected() {
    let mut cluster = TestCluster::new(3, 0);
    cluster.start();
    let leader = cluster.await_leader();
    cluster.run_until("followers settle", |cluster| {
        cluster.running_members().all(|m| !m.agent.in_election())
    });
    let follower = (0..3).find(|i| *i != leader).unwrap() as i32;

    let mut client = TestClient::new(&cluster, "redirect");
    client.connect(follower);
    run_client_until(&mut cluster, &mut client, |client| client.connected);
    assert_eq!(client.leader_member_id, leader as i32);
}

#[test]
fn session_limit_rejects_excess_clients() {
    let mut cluster = TestCluster::new(1, 0);
    cluster.start();
    cluster.await_leader();

    let mut clients: Vec<TestClient> = (0..11)
        .map(|i| TestClient::new(&cluster, &format!("limit-{}", i)))
        .collect();
    for client in clients.iter_mut() {
        client.connect(0);
    }

    let mut ticks = 0;
    loop {
        cluster.tick();
        for client in clients.iter_mut() {
            client.poll();
        }
        let connected = clients.iter().filter(|c| c.connected).count();
        let rejected = clients.iter().filter(|c| !c.rejections.is_empty()).count();
        if connected + rejected == clients.len() {
            assert_eq!(connected, 10, "default session limit");
            assert_eq!(rejected, 1);
            break;
        }
        ticks += 1;
        assert!(ticks < MAX_TICKS, "admission did not settle");
    }
}
