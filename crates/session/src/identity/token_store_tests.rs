// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use bazaar_store::{MemoryKv, PersistentKv};

use super::*;

fn session() -> Session {
    Session {
        user_id: "u-1".into(),
        access_token: "access-aaaaaaaa".into(),
        refresh_token: "refresh-1".into(),
        expires_at: 1_700_000_000_000,
        claims: IdentityClaims {
            email: Some("ada@example.com".into()),
            name: Some("Ada".into()),
            avatar_url: None,
        },
    }
}

#[test]
fn save_then_load_from_another_context() {
    let kv = MemoryKv::new();
    let tab_a = TokenStore::new(Arc::new(kv.context()), DEFAULT_TOKEN_KEY);
    let tab_b = TokenStore::new(Arc::new(kv.context()), DEFAULT_TOKEN_KEY);

    tab_a.save(&session());
    assert_eq!(tab_b.load(), Some(session()));

    tab_b.clear();
    assert_eq!(tab_a.load(), None);
}

#[test]
fn unreadable_record_is_removed() {
    let kv = MemoryKv::new();
    kv.set(DEFAULT_TOKEN_KEY, "not json".to_owned());
    let store = TokenStore::new(Arc::new(kv.clone()), DEFAULT_TOKEN_KEY);

    assert_eq!(store.load(), None);
    assert!(kv.get(DEFAULT_TOKEN_KEY).is_none());
}

#[test]
fn claims_prefer_full_name() {
    let user = StoredUser {
        id: "u".into(),
        email: None,
        user_metadata: UserMetadata {
            full_name: Some("Ada Lovelace".into()),
            name: Some("ada".into()),
            avatar_url: None,
        },
    };
    assert_eq!(user.claims().name.as_deref(), Some("Ada Lovelace"));
}

#[test]
fn debug_output_hides_tokens() {
    let rendered = format!("{:?} {:?}", session(), StoredSession::from(&session()));
    assert!(!rendered.contains("access-aaaaaaaa"));
    assert!(!rendered.contains("refresh-1"));
}
