use std::sync::Arc;

use ballot_sync::ElectionClient;
use ballot_sync::config::ClientConfig;
use ballot_sync::errors::ErrorKind;
use ballot_sync::integrity::{self, IssueCode};
use ballot_sync::mock_ledger::{MockLedger, MockOp};
use ballot_sync::phase::Phase;
use ballot_sync::types::{Address, snapshot_from_json, snapshot_to_json};
use hex_literal::hex;

const COMMISSIONER: Address = hex!("c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0");
const VOTERS: [Address; 3] = [
    hex!("a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1"),
    hex!("b2b2b2b2b2b2b2b2b2b2b2b2b2b2b2b2b2b2b2b2"),
    hex!("d3d3d3d3d3d3d3d3d3d3d3d3d3d3d3d3d3d3d3d3"),
];

fn setup() -> (Arc<MockLedger>, ElectionClient) {
    let ledger = Arc::new(MockLedger::new(COMMISSIONER));
    let clock = ledger.clone();
    let client = ElectionClient::new(ledger.clone(), ClientConfig::default())
        .unwrap()
        .with_clock(move || clock.now());
    (ledger, client)
}

/// Two candidates, three registered voters, voting open.
async fn open_election(ledger: &MockLedger, client: &ElectionClient) {
    let now = ledger.now();
    client
        .create_election(
            COMMISSIONER,
            "Student council",
            "Spring term",
            now + 3_600,
            now + 7_200,
            now + 86_400,
        )
        .await
        .unwrap();
    client
        .add_candidate(COMMISSIONER, "Ada", "Blue", "Open books")
        .await
        .unwrap();
    client
        .add_candidate(COMMISSIONER, "Grace", "Green", "Longer library hours")
        .await
        .unwrap();

    client.self_register(VOTERS[0]).await.unwrap();
    client.self_register(VOTERS[1]).await.unwrap();
    client
        .register_voter(COMMISSIONER, VOTERS[2])
        .await
        .unwrap();
    assert_eq!(client.phase().await.unwrap(), Phase::Registration);

    ledger.advance_time(7_200);
    assert_eq!(client.phase().await.unwrap(), Phase::Voting);
    client.start_voting(COMMISSIONER).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn two_votes_one_abstention() {
    let (ledger, client) = setup();
    open_election(&ledger, &client).await;

    client.vote(VOTERS[0], 1).await.unwrap();
    client.vote(VOTERS[1], 2).await.unwrap();
    client.vote(VOTERS[0], 1).await.unwrap_err();

    let stats = client.statistics().await.unwrap();
    assert_eq!(stats.total_votes_cast, 2);
    assert_eq!(stats.total_registered_voters, 3);
    assert_eq!(stats.turnout_percentage, 66);

    let winner = client.winner().await.unwrap();
    assert_eq!(winner.vote_count, 1);
    assert!(winner.is_tie);

    let (snapshot, report) = integrity::audit(&client, &VOTERS).await.unwrap();
    assert!(report.is_valid, "{report:?}");
    assert_eq!(snapshot.voters.iter().filter(|v| v.has_voted).count(), 2);
}

#[tokio::test(start_paused = true)]
async fn single_leader_is_not_a_tie() {
    let (ledger, client) = setup();
    open_election(&ledger, &client).await;

    client.vote(VOTERS[0], 2).await.unwrap();

    let winner = client.winner().await.unwrap();
    assert_eq!(winner.candidate_id, 2);
    assert_eq!(winner.vote_count, 1);
    assert!(!winner.is_tie);
}

#[tokio::test(start_paused = true)]
async fn double_vote_is_rejected_without_retry() {
    let (ledger, client) = setup();
    open_election(&ledger, &client).await;
    client.vote(VOTERS[2], 1).await.unwrap();

    let sends = ledger.calls(MockOp::Send);
    let err = client.vote(VOTERS[2], 1).await.unwrap_err();
    let normalized = err.normalize();
    assert_eq!(normalized.kind, ErrorKind::LedgerRevert);
    assert_eq!(normalized.raw, "Already voted");
    assert_eq!(normalized.message, "You have already voted in this election.");
    assert_eq!(ledger.calls(MockOp::Send), sends);

    let voter = client.voter(VOTERS[2]).await.unwrap();
    assert!(voter.has_voted);
    assert_eq!(voter.candidate_voted, 1);
}

#[tokio::test(start_paused = true)]
async fn tallies_match_votes_through_finalization() {
    let (ledger, client) = setup();
    open_election(&ledger, &client).await;

    for (voter, candidate) in VOTERS.iter().zip([1, 2, 1]) {
        client.vote(*voter, candidate).await.unwrap();
        let tallied: u64 = client
            .candidates()
            .await
            .unwrap()
            .iter()
            .map(|c| c.vote_count)
            .sum();
        let info = client.election_info().await.unwrap().unwrap();
        assert_eq!(tallied, info.total_votes);
    }
    assert_eq!(client.statistics().await.unwrap().total_votes_cast, 3);

    let err = client.finalize_election(COMMISSIONER).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LedgerRevert);

    client.end_voting(COMMISSIONER).await.unwrap();
    ledger.advance_time(86_400);
    assert_eq!(client.phase().await.unwrap(), Phase::Ended);
    assert!(client.permissions(COMMISSIONER).await.unwrap().can_finalize);

    client.finalize_election(COMMISSIONER).await.unwrap();
    assert_eq!(client.phase().await.unwrap(), Phase::Finalized);
    let info = client.election_info().await.unwrap().unwrap();
    assert_eq!(info.winner_id, 1);

    // Offline audit of a saved snapshot gives the same answer.
    let snapshot = client.snapshot(&VOTERS).await.unwrap();
    let json = snapshot_to_json(&snapshot).unwrap();
    let restored = snapshot_from_json(&json).unwrap();
    assert_eq!(restored, snapshot);
    assert!(integrity::validate(&restored).is_valid);

    let mut tampered = restored;
    tampered.statistics.total_votes_cast += 1;
    let report = integrity::validate(&tampered);
    assert!(report.has(IssueCode::VoteCountMismatch));
    assert!(report.has(IssueCode::VoterTallyMismatch));
}

#[tokio::test(start_paused = true)]
async fn history_records_confirmed_and_failed_writes() {
    let (ledger, client) = setup();
    open_election(&ledger, &client).await;
    client.vote(VOTERS[0], 1).await.unwrap();
    client.vote(VOTERS[0], 1).await.unwrap_err();

    let history = client.history();
    let last_two: Vec<_> = history.iter().rev().take(2).collect();
    assert_eq!(last_two[0].method, "vote");
    assert!(last_two[0].error.is_some());
    assert_eq!(last_two[1].method, "vote");
    assert!(last_two[1].error.is_none());
    assert!(client.pending().is_empty());
}
