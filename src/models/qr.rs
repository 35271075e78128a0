// Worker credentials encode a URL such as `http://host/api/registrar-qr/42/`.
const QR_ROUTE_SEGMENT: &str = "registrar-qr";

/// Extracts the worker identifier from a decoded QR payload.
///
/// Credential URLs yield the numeric segment after `registrar-qr`; any other
/// non-empty payload is used verbatim. Returns `None` for blank payloads and
/// for credential URLs whose id segment is not numeric.
pub fn worker_id_from_qr(payload: &str) -> Option<String> {
    let payload = payload.trim();
    if payload.is_empty() {
        return None;
    }

    let mut segments = payload.split('/');
    if segments.by_ref().any(|segment| segment == QR_ROUTE_SEGMENT) {
        return segments
            .next()
            .filter(|id| !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()))
            .map(str::to_string);
    }

    Some(payload.to_string())
}

/// Strict variant for scanners that only accept worker credentials: the
/// payload must contain `registrar-qr/<digits>`, otherwise `None`.
pub fn worker_id_from_credential_url(payload: &str) -> Option<String> {
    let payload = payload.trim();
    if !payload.split('/').any(|segment| segment == QR_ROUTE_SEGMENT) {
        return None;
    }
    worker_id_from_qr(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_id_from_credential_url() {
        assert_eq!(
            worker_id_from_qr("http://127.0.0.1:8000/api/registrar-qr/42/"),
            Some("42".to_string())
        );
        assert_eq!(
            worker_id_from_qr("/registrar-qr/7"),
            Some("7".to_string())
        );
    }

    #[test]
    fn rejects_malformed_credential_url() {
        assert_eq!(worker_id_from_qr("http://host/api/registrar-qr/abc/"), None);
        assert_eq!(worker_id_from_qr("http://host/api/registrar-qr/"), None);
    }

    #[test]
    fn plain_payload_is_taken_verbatim() {
        assert_eq!(worker_id_from_qr("  W-17 "), Some("W-17".to_string()));
        assert_eq!(worker_id_from_qr("   "), None);
    }

    #[test]
    fn strict_parsing_only_accepts_credential_urls() {
        assert_eq!(
            worker_id_from_credential_url("http://127.0.0.1:8000/api/registrar-qr/42/"),
            Some("42".to_string())
        );
        assert_eq!(worker_id_from_credential_url("W-17"), None);
        assert_eq!(worker_id_from_credential_url("https://example.com/menu"), None);
        assert_eq!(worker_id_from_credential_url("http://host/registrar-qr/x1/"), None);
    }
}
