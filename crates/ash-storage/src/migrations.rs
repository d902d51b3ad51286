//! Versioned migration set shared by both backends. Each entry is `(name,
//! sqlite_sql, postgres_sql)` — the two dialects differ only in id/timestamp
//! column types, so the table shapes stay identical.

pub struct Migration {
    pub name: &'static str,
    pub sqlite: &'static str,
    pub postgres: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        name: "0001_agents",
        sqlite: r#"
            CREATE TABLE agents (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                name TEXT NOT NULL,
                version INTEGER NOT NULL,
                path TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (tenant_id, name)
            );
        "#,
        postgres: r#"
            CREATE TABLE agents (
                id UUID PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                name TEXT NOT NULL,
                version BIGINT NOT NULL,
                path TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                UNIQUE (tenant_id, name)
            );
        "#,
    },
    Migration {
        name: "0002_sessions",
        sqlite: r#"
            CREATE TABLE sessions (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                agent_name TEXT NOT NULL,
                sandbox_id TEXT,
                status TEXT NOT NULL,
                runner_id TEXT,
                parent_session_id TEXT,
                model TEXT,
                config TEXT,
                turn_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                last_active_at TEXT NOT NULL
            );
            CREATE INDEX idx_sessions_tenant_agent ON sessions (tenant_id, agent_name);
            CREATE INDEX idx_sessions_runner ON sessions (runner_id);
        "#,
        postgres: r#"
            CREATE TABLE sessions (
                id UUID PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                agent_name TEXT NOT NULL,
                sandbox_id UUID,
                status TEXT NOT NULL,
                runner_id UUID,
                parent_session_id UUID,
                model TEXT,
                config JSONB,
                turn_count BIGINT NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL,
                last_active_at TIMESTAMPTZ NOT NULL
            );
            CREATE INDEX idx_sessions_tenant_agent ON sessions (tenant_id, agent_name);
            CREATE INDEX idx_sessions_runner ON sessions (runner_id);
        "#,
    },
    Migration {
        name: "0003_sandboxes",
        sqlite: r#"
            CREATE TABLE sandboxes (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                session_id TEXT,
                agent_name TEXT NOT NULL,
                state TEXT NOT NULL,
                workspace_dir TEXT NOT NULL,
                created_at TEXT NOT NULL,
                last_used_at TEXT NOT NULL,
                install_completed_at TEXT
            );
            CREATE INDEX idx_sandboxes_tenant_state ON sandboxes (tenant_id, state);
            CREATE INDEX idx_sandboxes_session ON sandboxes (session_id);
        "#,
        postgres: r#"
            CREATE TABLE sandboxes (
                id UUID PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                session_id UUID,
                agent_name TEXT NOT NULL,
                state TEXT NOT NULL,
                workspace_dir TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                last_used_at TIMESTAMPTZ NOT NULL,
                install_completed_at TIMESTAMPTZ
            );
            CREATE INDEX idx_sandboxes_tenant_state ON sandboxes (tenant_id, state);
            CREATE INDEX idx_sandboxes_session ON sandboxes (session_id);
        "#,
    },
    Migration {
        name: "0004_messages_events",
        sqlite: r#"
            CREATE TABLE messages (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (tenant_id, session_id, sequence)
            );
            CREATE TABLE session_events (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                data TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (tenant_id, session_id, sequence)
            );
        "#,
        postgres: r#"
            CREATE TABLE messages (
                id UUID PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                session_id UUID NOT NULL,
                role TEXT NOT NULL,
                content JSONB NOT NULL,
                sequence BIGINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                UNIQUE (tenant_id, session_id, sequence)
            );
            CREATE TABLE session_events (
                id UUID PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                session_id UUID NOT NULL,
                event_type TEXT NOT NULL,
                data JSONB NOT NULL,
                sequence BIGINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                UNIQUE (tenant_id, session_id, sequence)
            );
        "#,
    },
    Migration {
        name: "0005_runners",
        sqlite: r#"
            CREATE TABLE runners (
                id TEXT PRIMARY KEY,
                host TEXT NOT NULL,
                port INTEGER NOT NULL,
                max_sandboxes INTEGER NOT NULL,
                active_count INTEGER NOT NULL DEFAULT 0,
                warming_count INTEGER NOT NULL DEFAULT 0,
                last_heartbeat_at TEXT NOT NULL,
                registered_at TEXT NOT NULL,
                UNIQUE (host, port)
            );
        "#,
        postgres: r#"
            CREATE TABLE runners (
                id UUID PRIMARY KEY,
                host TEXT NOT NULL,
                port INTEGER NOT NULL,
                max_sandboxes INTEGER NOT NULL,
                active_count INTEGER NOT NULL DEFAULT 0,
                warming_count INTEGER NOT NULL DEFAULT 0,
                last_heartbeat_at TIMESTAMPTZ NOT NULL,
                registered_at TIMESTAMPTZ NOT NULL,
                UNIQUE (host, port)
            );
        "#,
    },
    Migration {
        name: "0006_supporting_tables",
        sqlite: r#"
            CREATE TABLE api_keys (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                key_hash TEXT NOT NULL,
                label TEXT,
                created_at TEXT NOT NULL
            );
            CREATE TABLE credentials (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                name TEXT NOT NULL,
                encrypted_value BLOB NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (tenant_id, name)
            );
            CREATE TABLE attachments (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                key TEXT NOT NULL,
                content_type TEXT,
                size_bytes INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE TABLE usage_events (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                query_id TEXT NOT NULL,
                input_tokens INTEGER NOT NULL,
                output_tokens INTEGER NOT NULL,
                cost_usd REAL NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE TABLE queue_items (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                queue_name TEXT NOT NULL,
                payload TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
        "#,
        postgres: r#"
            CREATE TABLE api_keys (
                id UUID PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                key_hash TEXT NOT NULL,
                label TEXT,
                created_at TIMESTAMPTZ NOT NULL
            );
            CREATE TABLE credentials (
                id UUID PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                name TEXT NOT NULL,
                encrypted_value BYTEA NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                UNIQUE (tenant_id, name)
            );
            CREATE TABLE attachments (
                id UUID PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                session_id UUID NOT NULL,
                key TEXT NOT NULL,
                content_type TEXT,
                size_bytes BIGINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            );
            CREATE TABLE usage_events (
                id UUID PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                session_id UUID NOT NULL,
                query_id TEXT NOT NULL,
                input_tokens BIGINT NOT NULL,
                output_tokens BIGINT NOT NULL,
                cost_usd DOUBLE PRECISION NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            );
            CREATE TABLE queue_items (
                id UUID PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                queue_name TEXT NOT NULL,
                payload JSONB NOT NULL,
                status TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            );
        "#,
    },
];
