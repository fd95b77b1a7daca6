diesel::table! {
    messages (id) {
        id -> Int4,
        username -> Text,
        text -> Text,
        timestamp -> Int8,
    }
}
