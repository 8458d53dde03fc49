use {
    std::convert::Infallible,
    fnctl_sdk::{Context, Event, handler},
};

handler!(handler, hello);

pub fn hello(event: Event, _context: Context) -> Result<String, Infallible> {
    let name = event.query.get("name")
        .map(String::as_str)
        .filter(|v| !v.is_empty())
        .unwrap_or("world");

    Ok(format!("Hello, {name}"))
}
