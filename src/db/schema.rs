/// Idempotent bootstrap statements, run in order at startup.
pub const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        user_id         BIGINT PRIMARY KEY,
        global_exp      BIGINT NOT NULL DEFAULT 0 CHECK (global_exp >= 0),
        global_level    INTEGER NOT NULL DEFAULT 0,
        total_currency  BIGINT NOT NULL DEFAULT 0,
        total_messages  BIGINT NOT NULL DEFAULT 0,
        total_reactions BIGINT NOT NULL DEFAULT 0,
        last_seen       TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS guilds (
        guild_id        BIGINT PRIMARY KEY,
        vault_currency  BIGINT NOT NULL DEFAULT 0,
        updated_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS guild_users (
        guild_id        BIGINT NOT NULL,
        user_id         BIGINT NOT NULL,
        exp             BIGINT NOT NULL DEFAULT 0 CHECK (exp >= 0),
        level           INTEGER NOT NULL DEFAULT 0,
        exp_gained      BIGINT NOT NULL DEFAULT 0,
        streak          INTEGER NOT NULL DEFAULT 0,
        currency        BIGINT NOT NULL DEFAULT 0,
        messages_sent   BIGINT NOT NULL DEFAULT 0,
        reactions_sent  BIGINT NOT NULL DEFAULT 0,
        last_active     TIMESTAMPTZ,
        PRIMARY KEY (guild_id, user_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS game_outcomes (
        id              BIGSERIAL PRIMARY KEY,
        guild_id        BIGINT NOT NULL,
        user_id         BIGINT NOT NULL,
        game_type       TEXT NOT NULL,
        wager           BIGINT NOT NULL,
        amount_won      BIGINT NOT NULL DEFAULT 0,
        amount_lost     BIGINT NOT NULL DEFAULT 0,
        result          TEXT NOT NULL,
        payload         JSONB,
        played_at       TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS game_outcomes_guild_user_idx
        ON game_outcomes (guild_id, user_id, played_at DESC)
    "#,
];
