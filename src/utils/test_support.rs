/// Returns true when the sandbox cannot host an `httpmock` server.
pub fn should_skip_httpmock() -> bool {
    match std::net::TcpListener::bind(("127.0.0.1", 0)) {
        Ok(_) => false,
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
            eprintln!("skipping vendor mock test: cannot bind 127.0.0.1");
            true
        }
        Err(err) => panic!("failed to bind localhost for vendor mocks: {err}"),
    }
}

/// Redis endpoint for store tests; they are skipped when unset.
pub fn redis_url() -> Option<String> {
    ["VUZO_REDIS_URL", "REDIS_URL"].iter().find_map(|key| {
        std::env::var(key)
            .ok()
            .filter(|value| !value.trim().is_empty())
    })
}
