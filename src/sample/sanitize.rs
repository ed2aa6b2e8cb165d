/// Makes an instance identifier safe for the ingestion endpoint.
///
/// Runs of `_` collapse to a single `.` and runs of `:` collapse to a
/// single `-`. The output contains neither character, so applying it twice
/// yields the same string.
pub fn sanitize_instance(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut prev: Option<char> = None;

    for c in raw.chars() {
        match c {
            '_' | ':' if prev == Some(c) => {}
            '_' => out.push('.'),
            ':' => out.push('-'),
            other => out.push(other),
        }
        prev = Some(c);
    }

    out
}

/// Sanitizes an instance and, when a device is present, prefixes it with
/// the sanitized device joined by `_`.
pub fn instance_with_device(instance: &str, device: Option<&str>) -> String {
    let instance = sanitize_instance(instance);
    match device.filter(|d| !d.is_empty()) {
        Some(device) => format!("{}_{}", sanitize_instance(device), instance),
        None => instance,
    }
}

/// Rewrites characters that collide with the `metric[instance]` field
/// syntax: brackets become parentheses, periods become slashes.
pub fn sanitize_metric_key(raw: &str) -> String {
    raw.chars()
        .map(|c| match c {
            '[' => '(',
            ']' => ')',
            '.' => '/',
            other => other,
        })
        .collect()
}
