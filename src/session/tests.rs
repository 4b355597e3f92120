use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;

use crate::config::SessionConfig;
use crate::db::prelude::*;
use crate::db::testing::{MemoryStore, StoreOp};
use crate::leveling::LevelCurve;
use crate::session::cache::{CacheKey, MemoryCache, SessionCache};
use crate::session::cached::CachedSessions;
use crate::session::{
    FlushedDeltas, Session, SessionBackend, SessionErr, SessionManager, XpGrant,
};
use crate::util::{Clock, ManualClock};

const GUILD: GuildId = GuildId(100);
const ALICE: UserId = UserId(1);
const BOB: UserId = UserId(2);

struct Harness {
    store: Arc<MemoryStore>,
    cache: Arc<MemoryCache>,
    clock: Arc<ManualClock>,
    manager: SessionManager,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let cache = Arc::new(MemoryCache::new());
    let clock = Arc::new(ManualClock::at("2024-03-01T12:00:00Z"));
    let manager = SessionManager::new(
        Some(cache.clone() as Arc<dyn SessionCache>),
        store.clone(),
        clock.clone(),
        LevelCurve::default(),
        SessionConfig::default(),
    );

    Harness {
        store,
        cache,
        clock,
        manager,
    }
}

impl Harness {
    async fn session(&self, guild_id: GuildId, user_id: UserId) -> Option<Session> {
        let raw = self
            .cache
            .get(&CacheKey::Session(guild_id, user_id).to_string())
            .await
            .unwrap()?;
        Some(Session::decode(&raw, guild_id, user_id, LevelCurve::default()).unwrap())
    }
}

fn member_records(exp: i64) -> (GuildUser, GlobalUser) {
    let member = GuildUser {
        guild_id: GUILD,
        user_id: ALICE,
        exp,
        level: LevelCurve::default().level_for(exp),
        exp_gained: 0,
        streak: 0,
        currency: 0,
        messages_sent: 0,
        reactions_sent: 0,
        last_active: None,
    };
    let user = GlobalUser {
        user_id: ALICE,
        global_exp: exp,
        global_level: LevelCurve::default().level_for(exp),
        total_currency: 0,
        total_messages: 0,
        total_reactions: 0,
        last_seen: None,
    };
    (member, user)
}

#[test]
fn test_decode_rejects_foreign_identity() {
    let clock = ManualClock::at("2024-03-01T12:00:00Z");
    let (member, user) = member_records(0);
    let raw = Session::from_records(&member, &user, LevelCurve::default(), clock.now())
        .encode()
        .unwrap();

    let err = Session::decode(&raw, GUILD, BOB, LevelCurve::default()).unwrap_err();
    assert!(matches!(err, SessionErr::Invalid { .. }));

    let err = Session::decode("{not json", GUILD, ALICE, LevelCurve::default()).unwrap_err();
    assert!(matches!(err, SessionErr::Corrupt { .. }));
}

#[test]
fn test_decode_repairs_level_drift() {
    let clock = ManualClock::at("2024-03-01T12:00:00Z");
    let (member, user) = member_records(400);
    let mut session = Session::from_records(&member, &user, LevelCurve::default(), clock.now());
    session.guild_level = 9;
    let raw = session.encode().unwrap();

    let repaired = Session::decode(&raw, GUILD, ALICE, LevelCurve::default()).unwrap();
    assert_eq!(repaired.guild_level, 2);
    assert!(repaired.dirty);
}

#[test]
fn test_from_records_marks_stale_level_dirty() {
    let clock = ManualClock::at("2024-03-01T12:00:00Z");
    let (mut member, user) = member_records(400);
    let fresh = Session::from_records(&member, &user, LevelCurve::default(), clock.now());
    assert!(!fresh.dirty);

    member.level = 0;
    let stale = Session::from_records(&member, &user, LevelCurve::default(), clock.now());
    assert_eq!(stale.guild_level, 2);
    assert!(stale.dirty);
}

#[test]
fn test_settle_keeps_mutations_made_during_flush() {
    let clock = ManualClock::at("2024-03-01T12:00:00Z");
    let (member, user) = member_records(0);
    let mut live = Session::from_records(&member, &user, LevelCurve::default(), clock.now());
    live.record_message(clock.now());
    live.apply_currency(25, clock.now());

    let snapshot = live.clone();
    live.record_message(clock.now());
    live.apply_currency(-5, clock.now());

    live.settle(
        &snapshot,
        &FlushedDeltas {
            currency: 25,
            messages: 1,
            complete: true,
            ..FlushedDeltas::default()
        },
        LevelCurve::default(),
    );

    assert_eq!(live.messages_to_flush, 1);
    assert_eq!(live.currency_to_flush, -5);
    assert_eq!(live.currency, 20);
    assert!(live.dirty);

    let snapshot = live.clone();
    live.settle(
        &snapshot,
        &FlushedDeltas {
            currency: -5,
            messages: 1,
            complete: true,
            ..FlushedDeltas::default()
        },
        LevelCurve::default(),
    );
    assert!(!live.dirty);
    assert_eq!(live.currency_to_flush, 0);
}

#[test]
fn test_settle_rebases_experience_on_stored_totals() {
    let clock = ManualClock::at("2024-03-01T12:00:00Z");
    let curve = LevelCurve::default();
    let (member, user) = member_records(0);
    let mut live = Session::from_records(&member, &user, curve, clock.now());
    live.grant_experience(30, Duration::ZERO, 1.0, curve, clock.now());

    let snapshot = live.clone();
    clock.advance_secs(1);
    live.grant_experience(15, Duration::ZERO, 1.0, curve, clock.now());

    // the store also saw 80 written around the session
    live.settle(
        &snapshot,
        &FlushedDeltas {
            exp: 30,
            totals: Some(ExperienceTotals {
                guild_exp: 110,
                global_exp: 110,
            }),
            complete: true,
            ..FlushedDeltas::default()
        },
        curve,
    );

    assert_eq!(live.exp_to_flush, 15);
    assert_eq!((live.guild_exp, live.global_exp), (125, 125));
    assert_eq!(live.guild_level, 1);
    assert!(live.dirty);
}

#[tokio::test]
async fn test_missing_user_has_no_session() {
    let h = harness();

    assert!(h.manager.get_or_create_session(GUILD, ALICE).await.unwrap().is_none());

    let err = h
        .manager
        .grant_experience(GUILD, ALICE, 20, Duration::from_secs(30), 1.0)
        .await
        .unwrap_err();
    assert!(matches!(err, SessionErr::UserNotFound { .. }));
}

#[tokio::test]
async fn test_backend_mutation_without_session_is_detectable() {
    let store = Arc::new(MemoryStore::new());
    store.seed_member(GUILD, ALICE, 0, 10).await;
    let sessions = CachedSessions::new(
        Arc::new(MemoryCache::new()),
        store,
        Arc::new(ManualClock::at("2024-03-01T12:00:00Z")),
        LevelCurve::default(),
        SessionConfig::default(),
    );

    let err = sessions.update_currency(GUILD, ALICE, 5).await.unwrap_err();
    assert!(matches!(err, SessionErr::NoSession { .. }));

    sessions.get_or_create_session(GUILD, ALICE).await.unwrap();
    assert_eq!(sessions.update_currency(GUILD, ALICE, 5).await.unwrap(), 15);
}

#[tokio::test]
async fn test_cooldown_grants_once() {
    let h = harness();
    h.store.seed_member(GUILD, ALICE, 0, 0).await;
    let cooldown = Duration::from_secs(3);

    let first = h
        .manager
        .grant_experience(GUILD, ALICE, 10, cooldown, 1.0)
        .await
        .unwrap();
    h.clock.advance_secs(1);
    let second = h
        .manager
        .grant_experience(GUILD, ALICE, 10, cooldown, 1.0)
        .await
        .unwrap();

    assert_eq!(first.granted, 10);
    assert_eq!(second, XpGrant::none(0));
    assert_eq!(h.session(GUILD, ALICE).await.unwrap().guild_exp, 10);

    h.clock.advance_secs(3);
    let third = h
        .manager
        .grant_experience(GUILD, ALICE, 10, cooldown, 1.0)
        .await
        .unwrap();
    assert_eq!(third.granted, 10);
}

#[tokio::test]
async fn test_concurrent_grants_lose_nothing() {
    let h = harness();
    h.store.seed_member(GUILD, ALICE, 0, 0).await;
    h.manager.get_or_create_session(GUILD, ALICE).await.unwrap();

    let grants = (0..25).map(|_| {
        let manager = h.manager.clone();
        tokio::spawn(async move {
            manager
                .grant_experience(GUILD, ALICE, 10, Duration::ZERO, 1.0)
                .await
        })
    });

    for grant in join_all(grants).await {
        assert_eq!(grant.unwrap().unwrap().granted, 10);
    }

    let session = h.session(GUILD, ALICE).await.unwrap();
    assert_eq!(session.guild_exp, 250);
    assert_eq!(session.global_exp, 250);
    assert_eq!(session.guild_level, 1);
}

#[tokio::test]
async fn test_level_up_is_reported_immediately() {
    let h = harness();
    h.store.seed_member(GUILD, ALICE, 90, 0).await;

    let grant = h
        .manager
        .grant_experience(GUILD, ALICE, 20, Duration::from_secs(3), 1.0)
        .await
        .unwrap();

    assert_eq!(
        grant,
        XpGrant {
            level_up: true,
            new_level: 1,
            granted: 20,
        }
    );
    // not flushed yet
    assert_eq!(h.store.member(GUILD, ALICE).await.unwrap().exp, 90);
}

#[tokio::test]
async fn test_activity_flushes_to_both_scopes() {
    let h = harness();
    h.store.seed_member(GUILD, ALICE, 0, 0).await;

    for _ in 0..7 {
        h.manager.track_message_activity(GUILD, ALICE).await.unwrap();
    }
    for _ in 0..3 {
        h.manager.track_reaction_activity(GUILD, ALICE).await.unwrap();
    }

    let report = h.manager.flush_dirty_sessions().await.unwrap();
    assert_eq!(report.sessions_flushed, 1);

    let member = h.store.member(GUILD, ALICE).await.unwrap();
    let user = h.store.user(ALICE).await.unwrap();
    assert_eq!((member.messages_sent, member.reactions_sent), (7, 3));
    assert_eq!((user.total_messages, user.total_reactions), (7, 3));

    // clean now: nothing more to write
    let report = h.manager.flush_dirty_sessions().await.unwrap();
    assert_eq!(report.sessions_flushed, 0);
    assert_eq!(h.store.member(GUILD, ALICE).await.unwrap().messages_sent, 7);

    let session = h.session(GUILD, ALICE).await.unwrap();
    assert!(!session.dirty);
    assert_eq!(session.messages_to_flush, 0);
    assert_eq!(session.messages_this_session, 7);
}

#[tokio::test]
async fn test_currency_reads_come_from_session() {
    let h = harness();
    h.store.seed_member(GUILD, ALICE, 0, 100).await;

    assert_eq!(h.manager.update_currency(GUILD, ALICE, 50).await.unwrap(), 150);
    assert_eq!(h.manager.update_currency(GUILD, ALICE, -30).await.unwrap(), 120);

    assert_eq!(h.manager.get_currency(GUILD, ALICE).await.unwrap(), Some(120));
    assert_eq!(h.store.member(GUILD, ALICE).await.unwrap().currency, 100);

    h.manager.flush_dirty_sessions().await.unwrap();

    assert_eq!(h.store.member(GUILD, ALICE).await.unwrap().currency, 120);
    assert_eq!(h.store.user(ALICE).await.unwrap().total_currency, 20);
    assert_eq!(h.session(GUILD, ALICE).await.unwrap().currency, 120);
}

#[tokio::test]
async fn test_failed_flush_retries_exactly_once() {
    let h = harness();
    h.store.seed_member(GUILD, ALICE, 0, 100).await;
    h.manager.update_currency(GUILD, ALICE, 40).await.unwrap();

    h.store.fail(StoreOp::Currency).await;
    let report = h.manager.flush_dirty_sessions().await.unwrap();
    assert_eq!(report.sessions_failed, 1);

    let session = h.session(GUILD, ALICE).await.unwrap();
    assert!(session.dirty);
    assert_eq!(session.currency_to_flush, 40);
    assert_eq!(h.store.member(GUILD, ALICE).await.unwrap().currency, 100);

    h.store.recover(StoreOp::Currency).await;
    let report = h.manager.flush_dirty_sessions().await.unwrap();
    assert_eq!(report.sessions_flushed, 1);
    h.manager.flush_dirty_sessions().await.unwrap();

    assert_eq!(h.store.member(GUILD, ALICE).await.unwrap().currency, 140);
    assert_eq!(h.store.writes(StoreOp::Currency).await, 1);
}

#[tokio::test]
async fn test_partial_flush_does_not_double_count() {
    let h = harness();
    h.store.seed_member(GUILD, ALICE, 0, 100).await;
    h.manager.update_currency(GUILD, ALICE, 40).await.unwrap();
    h.manager.track_message_activity(GUILD, ALICE).await.unwrap();

    // currency lands, activity does not
    h.store.fail(StoreOp::Activity).await;
    let report = h.manager.flush_dirty_sessions().await.unwrap();
    assert_eq!(report.sessions_failed, 1);

    let session = h.session(GUILD, ALICE).await.unwrap();
    assert!(session.dirty);
    assert_eq!(session.currency_to_flush, 0);
    assert_eq!(session.messages_to_flush, 1);

    h.store.recover(StoreOp::Activity).await;
    h.manager.flush_dirty_sessions().await.unwrap();

    let member = h.store.member(GUILD, ALICE).await.unwrap();
    assert_eq!(member.currency, 140);
    assert_eq!(member.messages_sent, 1);
    assert!(!h.session(GUILD, ALICE).await.unwrap().dirty);
}

#[tokio::test(start_paused = true)]
async fn test_failed_flush_rearms_ttl() {
    let h = harness();
    h.store.seed_member(GUILD, ALICE, 0, 0).await;
    h.manager.track_message_activity(GUILD, ALICE).await.unwrap();

    tokio::time::advance(Duration::from_secs(3_500)).await;
    h.store.fail(StoreOp::GuildProgress).await;
    h.manager.flush_dirty_sessions().await.unwrap();

    // past the original expiry
    tokio::time::advance(Duration::from_secs(200)).await;
    let session = h.session(GUILD, ALICE).await.unwrap();
    assert_eq!(session.messages_to_flush, 1);

    h.store.recover(StoreOp::GuildProgress).await;
    h.manager.flush_dirty_sessions().await.unwrap();
    assert_eq!(h.store.member(GUILD, ALICE).await.unwrap().messages_sent, 1);
}

#[tokio::test]
async fn test_shutdown_flush_writes_clean_sessions_once() {
    let h = harness();
    h.store.seed_member(GUILD, ALICE, 0, 0).await;
    h.store.seed_member(GUILD, BOB, 0, 0).await;

    h.manager.get_or_create_session(GUILD, ALICE).await.unwrap();
    h.manager.update_currency(GUILD, BOB, 10).await.unwrap();

    let report = h.manager.flush_dirty_sessions().await.unwrap();
    assert_eq!(report.sessions_flushed, 1);
    assert_eq!(h.store.writes(StoreOp::GuildProgress).await, 1);

    let report = h.manager.flush_all_sessions().await.unwrap();
    assert_eq!(report.sessions_flushed, 2);
    assert_eq!(h.store.writes(StoreOp::GuildProgress).await, 3);

    h.manager.flush_all_sessions().await.unwrap();
    assert_eq!(h.store.member(GUILD, BOB).await.unwrap().currency, 10);
    assert_eq!(h.store.writes(StoreOp::Currency).await, 1);
}

#[tokio::test]
async fn test_message_flow_with_cooldown() {
    let h = harness();
    h.store.seed_member(GUILD, ALICE, 0, 0).await;
    let cooldown = Duration::from_secs(30);

    h.manager.track_message_activity(GUILD, ALICE).await.unwrap();
    let first = h
        .manager
        .grant_experience(GUILD, ALICE, 20, cooldown, 1.0)
        .await
        .unwrap();

    h.clock.advance_secs(5);
    h.manager.track_message_activity(GUILD, ALICE).await.unwrap();
    let second = h
        .manager
        .grant_experience(GUILD, ALICE, 20, cooldown, 1.0)
        .await
        .unwrap();

    assert_eq!(first.granted, 20);
    assert_eq!(second.granted, 0);

    let session = h.session(GUILD, ALICE).await.unwrap();
    assert_eq!(session.guild_exp, 20);
    assert_eq!(session.messages_to_flush, 2);
    assert!(session.dirty);

    h.manager.flush_dirty_sessions().await.unwrap();
    let member = h.store.member(GUILD, ALICE).await.unwrap();
    assert_eq!(member.exp, 20);
    assert_eq!(member.messages_sent, 2);
    assert_eq!(h.store.user(ALICE).await.unwrap().global_exp, 20);
}

#[tokio::test]
async fn test_cache_outage_falls_back_symmetrically() {
    let h = harness();
    h.store.seed_member(GUILD, ALICE, 0, 0).await;

    h.cache.set_offline(true);
    h.manager.track_reaction_activity(GUILD, ALICE).await.unwrap();
    h.manager.track_message_activity(GUILD, ALICE).await.unwrap();
    assert!(h.manager.is_degraded());

    let member = h.store.member(GUILD, ALICE).await.unwrap();
    let user = h.store.user(ALICE).await.unwrap();
    assert_eq!((member.messages_sent, member.reactions_sent), (1, 1));
    assert_eq!((user.total_messages, user.total_reactions), (1, 1));

    h.cache.set_offline(false);
    h.manager.track_reaction_activity(GUILD, ALICE).await.unwrap();
    assert!(!h.manager.is_degraded());
    assert_eq!(h.session(GUILD, ALICE).await.unwrap().reactions_to_flush, 1);
}

#[tokio::test]
async fn test_unknown_user_activity_is_written_through() {
    let h = harness();

    h.manager.track_reaction_activity(GUILD, BOB).await.unwrap();

    assert!(h.session(GUILD, BOB).await.is_none());
    assert_eq!(h.store.member(GUILD, BOB).await.unwrap().reactions_sent, 1);
    assert_eq!(h.store.user(BOB).await.unwrap().total_reactions, 1);
}

#[tokio::test]
async fn test_without_cache_everything_is_direct() {
    let store = Arc::new(MemoryStore::new());
    store.seed_member(GUILD, ALICE, 0, 5).await;
    let manager = SessionManager::new(
        None,
        store.clone(),
        Arc::new(ManualClock::at("2024-03-01T12:00:00Z")),
        LevelCurve::default(),
        SessionConfig::default(),
    );

    assert!(!manager.is_cached());
    assert_eq!(manager.update_currency(GUILD, ALICE, 5).await.unwrap(), 10);
    manager
        .grant_experience(GUILD, ALICE, 15, Duration::from_secs(3), 1.0)
        .await
        .unwrap();

    let member = store.member(GUILD, ALICE).await.unwrap();
    assert_eq!((member.currency, member.exp), (10, 15));
    assert!(!manager.stats().await.unwrap().cache_available);
}

#[tokio::test]
async fn test_game_outcomes_are_batched() {
    let h = harness();
    h.store.seed_member(GUILD, ALICE, 0, 0).await;

    for wager in [10, 20, 30] {
        h.manager
            .queue_game_outcome(GameOutcome {
                guild_id: GUILD,
                user_id: ALICE,
                game_type: "coinflip".into(),
                wager,
                amount_won: 0,
                amount_lost: wager,
                result: GameResult::Loss,
                payload: Some(serde_json::json!({ "side": "heads" })),
                played_at: None,
            })
            .await
            .unwrap();
    }

    assert_eq!(h.session(GUILD, ALICE).await.unwrap().pending_games.len(), 3);
    h.manager.flush_dirty_sessions().await.unwrap();

    let games = h.store.games().await;
    assert_eq!(games.len(), 3);
    assert_eq!(h.store.writes(StoreOp::Games).await, 1);
    assert!(games.iter().all(|game| game.played_at.is_some()));
    assert!(h.session(GUILD, ALICE).await.unwrap().pending_games.is_empty());
}

#[tokio::test]
async fn test_vault_accumulates_until_flush() {
    let h = harness();

    h.manager.add_vault_currency(GUILD, 30).await.unwrap();
    h.manager.add_vault_currency(GUILD, 20).await.unwrap();
    assert_eq!(h.manager.get_vault_currency_delta(GUILD).await.unwrap(), 50);

    let stats = h.manager.stats().await.unwrap();
    assert_eq!((stats.cached_vaults, stats.dirty_vaults), (1, 1));

    let report = h.manager.flush_dirty_sessions().await.unwrap();
    assert_eq!(report.vaults_flushed, 1);
    assert_eq!(h.store.vault(GUILD).await, 50);
    assert_eq!(h.manager.get_vault_currency_delta(GUILD).await.unwrap(), 0);
}

#[tokio::test]
async fn test_stats_count_dirty_sessions() {
    let h = harness();
    h.store.seed_member(GUILD, ALICE, 0, 0).await;
    h.store.seed_member(GUILD, BOB, 0, 0).await;

    h.manager.get_or_create_session(GUILD, ALICE).await.unwrap();
    h.manager.track_message_activity(GUILD, BOB).await.unwrap();

    let stats = h.manager.stats().await.unwrap();
    assert!(stats.cache_available);
    assert_eq!((stats.active_sessions, stats.dirty_sessions), (2, 1));

    assert!(h.manager.flush_session(GUILD, BOB).await.unwrap());
    assert!(!h.manager.flush_session(GUILD, ALICE).await.unwrap());
    assert_eq!(h.manager.stats().await.unwrap().dirty_sessions, 0);
}

#[tokio::test]
async fn test_direct_writes_during_outage_survive_recovery() {
    let h = harness();
    h.store.seed_member(GUILD, ALICE, 0, 100).await;
    let session = h.manager.get_or_create_session(GUILD, ALICE).await.unwrap().unwrap();
    assert_eq!((session.guild_exp, session.currency), (0, 100));

    h.cache.set_offline(true);
    let grant = h
        .manager
        .grant_experience(GUILD, ALICE, 20, Duration::ZERO, 1.0)
        .await
        .unwrap();
    assert_eq!(grant.granted, 20);
    assert_eq!(h.manager.update_currency(GUILD, ALICE, 50).await.unwrap(), 150);

    h.cache.set_offline(false);
    assert_eq!(h.manager.get_currency(GUILD, ALICE).await.unwrap(), Some(150));

    h.manager.track_message_activity(GUILD, ALICE).await.unwrap();
    h.manager.flush_dirty_sessions().await.unwrap();

    let member = h.store.member(GUILD, ALICE).await.unwrap();
    assert_eq!((member.exp, member.currency, member.messages_sent), (20, 150, 1));
    assert_eq!(h.store.user(ALICE).await.unwrap().global_exp, 20);

    let session = h.session(GUILD, ALICE).await.unwrap();
    assert_eq!((session.guild_exp, session.currency), (20, 150));
}

#[tokio::test]
async fn test_pending_experience_is_added_to_direct_grants() {
    let h = harness();
    h.store.seed_member(GUILD, ALICE, 0, 0).await;
    h.manager
        .grant_experience(GUILD, ALICE, 10, Duration::ZERO, 1.0)
        .await
        .unwrap();

    h.cache.set_offline(true);
    h.manager
        .grant_experience(GUILD, ALICE, 90, Duration::ZERO, 1.0)
        .await
        .unwrap();
    assert_eq!(h.store.member(GUILD, ALICE).await.unwrap().exp, 90);

    // the next call flushes the old session's 10 on top and starts over from the store
    h.cache.set_offline(false);
    let grant = h
        .manager
        .grant_experience(GUILD, ALICE, 5, Duration::ZERO, 1.0)
        .await
        .unwrap();
    assert_eq!(grant.new_level, 1);
    assert_eq!(h.store.member(GUILD, ALICE).await.unwrap().exp, 100);

    h.manager.flush_dirty_sessions().await.unwrap();
    let member = h.store.member(GUILD, ALICE).await.unwrap();
    let user = h.store.user(ALICE).await.unwrap();
    assert_eq!((member.exp, member.level), (105, 1));
    assert_eq!((user.global_exp, user.global_level), (105, 1));
}

#[tokio::test]
async fn test_activity_during_slow_flush_stays_pending() {
    let h = harness();
    h.store.seed_member(GUILD, ALICE, 0, 0).await;
    h.manager.track_message_activity(GUILD, ALICE).await.unwrap();

    let pause = h.store.pause(StoreOp::GlobalProgress).await;
    let flush = tokio::spawn({
        let manager = h.manager.clone();
        async move { manager.flush_dirty_sessions().await }
    });

    pause.reached.notified().await;
    h.manager.track_message_activity(GUILD, ALICE).await.unwrap();
    pause.resume.notify_one();

    let report = flush.await.unwrap().unwrap();
    assert_eq!(report.sessions_flushed, 1);
    assert_eq!(h.store.member(GUILD, ALICE).await.unwrap().messages_sent, 1);

    let session = h.session(GUILD, ALICE).await.unwrap();
    assert_eq!(session.messages_to_flush, 1);
    assert_eq!(session.messages_this_session, 2);
    assert!(session.dirty);

    h.manager.flush_dirty_sessions().await.unwrap();
    assert_eq!(h.store.member(GUILD, ALICE).await.unwrap().messages_sent, 2);
    assert!(!h.session(GUILD, ALICE).await.unwrap().dirty);
}

#[tokio::test]
async fn test_failed_vault_flush_is_applied_once() {
    let h = harness();
    h.manager.add_vault_currency(GUILD, 30).await.unwrap();

    h.store.fail(StoreOp::Vault).await;
    let report = h.manager.flush_dirty_sessions().await.unwrap();
    assert_eq!(report.vaults_failed, 1);
    assert_eq!(h.manager.get_vault_currency_delta(GUILD).await.unwrap(), 30);
    assert_eq!(h.store.vault(GUILD).await, 0);

    h.manager.add_vault_currency(GUILD, 5).await.unwrap();
    h.store.recover(StoreOp::Vault).await;
    let report = h.manager.flush_dirty_sessions().await.unwrap();
    assert_eq!(report.vaults_flushed, 1);
    h.manager.flush_dirty_sessions().await.unwrap();

    assert_eq!(h.store.vault(GUILD).await, 35);
    assert_eq!(h.store.writes(StoreOp::Vault).await, 1);
    assert_eq!(h.manager.get_vault_currency_delta(GUILD).await.unwrap(), 0);
}
