use diesel::{allow_tables_to_appear_in_same_query, table};

table! {
    notifications (id) {
        id -> BigInt,
        recipient -> Text,
        payload_text -> Text,
        due_at -> Timestamptz,
        sent -> Bool,
        claimed_at -> Nullable<Timestamptz>,
        source_recurrence_id -> Nullable<BigInt>,
        sent_at -> Nullable<Timestamptz>,
        failed_at -> Nullable<Timestamptz>,
        delivery_status -> Nullable<Text>,
        error_message -> Nullable<Text>,
        created_at -> Timestamptz,
    }
}

table! {
    recurring_definitions (id) {
        id -> BigInt,
        recipient -> Text,
        payload_text -> Text,
        recurrence_type -> Text,
        recurrence_day -> Nullable<Integer>,
        local_time -> Time,
        timezone -> Text,
        active -> Bool,
        last_generated_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
    }
}

table! {
    users (phone_number) {
        phone_number -> Text,
        first_name -> Nullable<Text>,
        timezone -> Text,
        daily_digest_enabled -> Bool,
        daily_digest_time -> Nullable<Time>,
        last_digest_sent_date -> Nullable<Date>,
    }
}

table! {
    delivery_dead_letters (id) {
        id -> BigInt,
        notification_id -> BigInt,
        recipient -> Text,
        error -> Text,
        created_at -> Timestamptz,
    }
}

allow_tables_to_appear_in_same_query!(
    notifications,
    recurring_definitions,
    users,
    delivery_dead_letters,
);
