diesel::table! {
    file_info (id) {
        id -> BigInt,
        abs_path -> Text,
        server_path -> Text,
        size -> BigInt,
        md5 -> Text,
        upload_status -> Integer,
        create_time -> BigInt,
        update_time -> BigInt,
    }
}

diesel::table! {
    backup_path (id) {
        id -> BigInt,
        abs_path -> Text,
        is_dir -> Bool,
        create_time -> BigInt,
        update_time -> BigInt,
    }
}
