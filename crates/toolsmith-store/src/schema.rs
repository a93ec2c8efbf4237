// Table definitions for the SQLite-backed event store.
//
// The DDL executed at open time lives in `store::SCHEMA_DDL`; these macros
// only describe the columns to diesel.

diesel::table! {
    events (id) {
        id -> Text,
        entity_id -> Text,
        #[sql_name = "type"]
        event_type -> Text,
        payload -> Text,
        timestamp -> BigInt,
        version -> BigInt,
    }
}

diesel::table! {
    snapshots (entity_id) {
        entity_id -> Text,
        state -> Text,
        version -> BigInt,
        created_at -> BigInt,
    }
}

diesel::table! {
    saga_state (saga_id) {
        saga_id -> Text,
        entity_id -> Text,
        status -> Text,
        current_step -> BigInt,
        total_steps -> BigInt,
        input -> Text,
        completed_steps -> Text,
        results -> Text,
        created_at -> BigInt,
        updated_at -> BigInt,
    }
}

diesel::table! {
    integrity_blocks (id) {
        id -> Text,
        previous_block_hash -> Nullable<Text>,
        merkle_root -> Text,
        start_event_id -> Text,
        end_event_id -> Text,
        event_count -> BigInt,
        created_at -> BigInt,
    }
}

diesel::allow_tables_to_appear_in_same_query!(events, snapshots, saga_state, integrity_blocks);
