//! Page extraction scripts evaluated inside the browser.

/// Collects the page's visible text, one block per line. Hidden elements
/// and script/style text are skipped.
pub const CONTENT_SCRIPT: &str = r#"
(() => {
  const blocks = [];
  if (!document.body) return '';
  const walker = document.createTreeWalker(document.body, NodeFilter.SHOW_TEXT);
  while (walker.nextNode()) {
    const node = walker.currentNode;
    const parent = node.parentElement;
    if (!parent) continue;
    const tag = parent.tagName;
    if (tag === 'SCRIPT' || tag === 'STYLE' || tag === 'NOSCRIPT' || tag === 'TEMPLATE') continue;
    const style = window.getComputedStyle(parent);
    if (style.display === 'none' || style.visibility === 'hidden') continue;
    const text = node.textContent.replace(/\s+/g, ' ').trim();
    if (text.length > 0) blocks.push(text);
  }
  return blocks.join('\n');
})()
"#;

/// Collects the page's outgoing links as "label: href" lines, deduplicated
/// by target.
pub const URLS_SCRIPT: &str = r#"
(() => {
  const seen = new Set();
  const lines = [];
  for (const anchor of document.querySelectorAll('a[href]')) {
    const href = anchor.href;
    if (!href || href.startsWith('javascript:') || seen.has(href)) continue;
    seen.add(href);
    const label = (anchor.textContent || '').replace(/\s+/g, ' ').trim();
    lines.push(label ? label + ': ' + href : href);
  }
  return lines.join('\n');
})()
"#;

/// Snapshot used to poll for DOM stability.
pub const DOM_SIZE_SCRIPT: &str =
    "document.documentElement ? document.documentElement.outerHTML.length : 0";
