//! HTML link rewriting.
//!
//! Rewrites `href`/`src` attributes so that root-relative links and links
//! pointing at the target's own origin resolve back through the proxy.
//! Markup outside the touched attributes passes through byte-for-byte.

use lol_html::{element, HtmlRewriter, Settings};
use url::Url;

use crate::error::{Result, ShroudError};
use crate::proxy::target::RegisteredTarget;

/// Join URL path elements, collapsing duplicate slashes at the seams.
pub fn join_url(elements: &[&str]) -> String {
    let last = elements.len().saturating_sub(1);
    let mut parts = Vec::with_capacity(elements.len());
    for (idx, element) in elements.iter().enumerate() {
        let mut element = *element;
        if idx > 0 {
            element = element.strip_prefix('/').unwrap_or(element);
        }
        if idx < last {
            element = element.strip_suffix('/').unwrap_or(element);
        }
        parts.push(element);
    }
    parts.join("/")
}

/// Rewrite one attribute value, or `None` when it should be left untouched.
///
/// Root-relative values and values on the target's own origin become
/// `<proxy-base><prefix>/<value minus origin>`; absolute URLs on any other
/// origin are not the proxy's business.
fn rewrite_attr(value: &str, proxy_base: &str, target: &RegisteredTarget) -> Option<String> {
    let is_root_relative = value.starts_with('/');
    let is_same_origin = value.starts_with(target.origin_str());
    if !is_root_relative && !is_same_origin {
        return None;
    }

    let stripped = value.strip_prefix(target.origin_str()).unwrap_or(value);
    Some(format!(
        "{}{}",
        proxy_base,
        join_url(&[&target.prefix, stripped])
    ))
}

/// Rewrite all proxied link attributes in an HTML document.
///
/// Covers `a[href]`, `link[href]`, `img[src]` and `script[src]`. The
/// document is streamed through the rewriter and re-serialized; a parse or
/// serialize failure is a `RewriteError`.
pub fn rewrite_html(html: &[u8], proxy_addr: &Url, target: &RegisteredTarget) -> Result<Vec<u8>> {
    let proxy_base = proxy_addr.as_str().trim_end_matches('/').to_string();
    let mut output = Vec::with_capacity(html.len());

    let mut rewriter = HtmlRewriter::new(
        Settings {
            element_content_handlers: vec![
                element!("a[href]", |el| {
                    if let Some(value) = el.get_attribute("href") {
                        if let Some(rewritten) = rewrite_attr(&value, &proxy_base, target) {
                            el.set_attribute("href", &rewritten)?;
                        }
                    }
                    Ok(())
                }),
                element!("link[href]", |el| {
                    if let Some(value) = el.get_attribute("href") {
                        if let Some(rewritten) = rewrite_attr(&value, &proxy_base, target) {
                            el.set_attribute("href", &rewritten)?;
                        }
                    }
                    Ok(())
                }),
                element!("img[src]", |el| {
                    if let Some(value) = el.get_attribute("src") {
                        if let Some(rewritten) = rewrite_attr(&value, &proxy_base, target) {
                            el.set_attribute("src", &rewritten)?;
                        }
                    }
                    Ok(())
                }),
                element!("script[src]", |el| {
                    if let Some(value) = el.get_attribute("src") {
                        if let Some(rewritten) = rewrite_attr(&value, &proxy_base, target) {
                            el.set_attribute("src", &rewritten)?;
                        }
                    }
                    Ok(())
                }),
            ],
            ..Settings::default()
        },
        |chunk: &[u8]| output.extend_from_slice(chunk),
    );

    rewriter
        .write(html)
        .map_err(|e| ShroudError::Rewrite(e.to_string()))?;
    rewriter
        .end()
        .map_err(|e| ShroudError::Rewrite(e.to_string()))?;
    Ok(output)
}
