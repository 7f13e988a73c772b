use std::any::Any;

use indicatif::ProgressStyle;

/// Progress bar style of an evaluation pass.
pub(crate) fn get_style_pass() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .map(|style| style.progress_chars("=>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar())
}

/// Turns the payload of a caught panic into something printable.
pub(crate) fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("transform panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("transform panicked: {s}")
    } else {
        String::from("transform panicked with unknown payload")
    }
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut acc = String::with_capacity(bytes.len() * 2);

    for byte in bytes {
        let _ = write!(&mut acc, "{byte:02x}");
    }

    acc
}
