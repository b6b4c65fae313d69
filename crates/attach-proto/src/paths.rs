//! HTTP and websocket paths shared by the server router and the client.

pub const API_PREFIX: &str = "/api/v1/attach-sessions";

fn escape(session_id: &str) -> String {
    let mut out = String::with_capacity(session_id.len());
    for byte in session_id.trim().bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

pub fn session_path(session_id: &str) -> String {
    format!("{API_PREFIX}/{}", escape(session_id))
}

pub fn attach_path(session_id: &str) -> String {
    format!("{}/attach", session_path(session_id))
}

pub fn attach_token_path(session_id: &str) -> String {
    format!("{}/attach-token", session_path(session_id))
}

pub fn attach_cookie_path(session_id: &str) -> String {
    format!("{}/attach-cookie", session_path(session_id))
}

pub fn attach_control_path(session_id: &str) -> String {
    format!("{}/attach-control", session_path(session_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn session_ids_are_path_escaped() {
        assert_eq!(attach_path("demo"), "/api/v1/attach-sessions/demo/attach");
        assert_eq!(
            attach_cookie_path(" a b/c "),
            "/api/v1/attach-sessions/a%20b%2Fc/attach-cookie"
        );
    }
}
