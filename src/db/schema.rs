diesel::table! {
    users (uuid) {
        uuid -> Text,
        created_at -> Timestamp,
        updated_at -> Timestamp,
        phone -> Nullable<Text>,
        phone_verified -> Bool,
        email -> Nullable<Text>,
        email_verified -> Bool,
        password_hash -> Nullable<Text>,
        nickname -> Nullable<Text>,
        avatar -> Nullable<Text>,
        status -> Integer,
        mfa_enabled -> Bool,
        totp_secret -> Nullable<Text>,
        totp_recover -> Nullable<Text>,
        totp_last_used -> BigInt,
        last_login_at -> Nullable<Timestamp>,
    }
}

diesel::table! {
    applications (uuid) {
        uuid -> Text,
        created_at -> Timestamp,
        updated_at -> Timestamp,
        owner_uuid -> Text,
        client_id -> Text,
        client_secret_hash -> Nullable<Text>,
        name -> Text,
        app_type -> Integer,
        is_trusted -> Bool,
        redirect_uris -> Text,
        grant_types -> Text,
        allow_plain_pkce -> Bool,
        custom_claims -> Nullable<Text>,
        branding -> Nullable<Text>,
        active -> Bool,
    }
}

diesel::table! {
    scopes (name) {
        name -> Text,
        description -> Text,
    }
}

diesel::table! {
    app_scopes (app_uuid, scope) {
        app_uuid -> Text,
        scope -> Text,
    }
}

diesel::table! {
    verification_codes (uuid) {
        uuid -> Text,
        target -> Text,
        code_hash -> Text,
        atype -> Integer,
        attempts -> Integer,
        used -> Bool,
        created_at -> Timestamp,
        expires_at -> Timestamp,
    }
}

diesel::table! {
    refresh_tokens (uuid) {
        uuid -> Text,
        user_uuid -> Text,
        client_uuid -> Nullable<Text>,
        token_hash -> Text,
        scope -> Text,
        family -> Text,
        device_fingerprint -> Nullable<Text>,
        ip -> Text,
        created_at -> Timestamp,
        expires_at -> Timestamp,
        revoked -> Bool,
    }
}

diesel::table! {
    authorization_codes (uuid) {
        uuid -> Text,
        code_hash -> Text,
        user_uuid -> Text,
        client_id -> Text,
        redirect_uri -> Text,
        scope -> Text,
        code_challenge -> Nullable<Text>,
        code_challenge_method -> Nullable<Text>,
        nonce -> Nullable<Text>,
        auth_time -> Nullable<Timestamp>,
        used -> Bool,
        created_at -> Timestamp,
        expires_at -> Timestamp,
    }
}

diesel::table! {
    sso_sessions (uuid) {
        uuid -> Text,
        token_hash -> Text,
        user_uuid -> Text,
        apps -> Text,
        remember -> Bool,
        ip -> Text,
        user_agent -> Nullable<Text>,
        created_at -> Timestamp,
        expires_at -> Timestamp,
        last_activity -> Timestamp,
    }
}

diesel::table! {
    oauth_accounts (uuid) {
        uuid -> Text,
        user_uuid -> Text,
        provider -> Text,
        provider_user_id -> Text,
        email -> Nullable<Text>,
        profile -> Nullable<Text>,
        created_at -> Timestamp,
    }
}

diesel::table! {
    webhooks (uuid) {
        uuid -> Text,
        app_uuid -> Text,
        url -> Text,
        secret -> Text,
        events -> Text,
        active -> Bool,
        created_at -> Timestamp,
    }
}

diesel::table! {
    webhook_deliveries (uuid) {
        uuid -> Text,
        webhook_uuid -> Text,
        event -> Text,
        payload -> Text,
        status -> Integer,
        attempt_count -> Integer,
        next_retry_at -> Timestamp,
        response_code -> Nullable<Integer>,
        response_body -> Nullable<Text>,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

diesel::table! {
    audit_logs (uuid) {
        uuid -> Text,
        user_uuid -> Nullable<Text>,
        action -> Text,
        ip -> Nullable<Text>,
        user_agent -> Nullable<Text>,
        detail -> Nullable<Text>,
        created_at -> Timestamp,
    }
}

diesel::joinable!(app_scopes -> applications (app_uuid));
diesel::joinable!(webhooks -> applications (app_uuid));
diesel::joinable!(webhook_deliveries -> webhooks (webhook_uuid));
diesel::joinable!(oauth_accounts -> users (user_uuid));
diesel::joinable!(refresh_tokens -> users (user_uuid));
diesel::joinable!(sso_sessions -> users (user_uuid));

diesel::allow_tables_to_appear_in_same_query!(
    users,
    applications,
    scopes,
    app_scopes,
    verification_codes,
    refresh_tokens,
    authorization_codes,
    sso_sessions,
    oauth_accounts,
    webhooks,
    webhook_deliveries,
    audit_logs,
);
