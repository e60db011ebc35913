//! Pull-based readers over the feed documents.
//!
//! A feed is consumed as a flat sequence of open/text/close nodes and turned
//! into one record at a time. Only the record under construction is held in
//! memory: the event buffer is cleared after every node and a record is
//! handed out as soon as its closing tag is seen. The iterators are forward
//! only; re-scanning a feed needs a fresh reader.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::marker::PhantomData;
use std::path::Path;

use log::warn;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::{MirrorError, Result};
use crate::models::cpe::{cpe22_to_cpe23, CpeItem};
use crate::models::cve::{Cve, CveName, VendorStatement, VendorStatementEntry};

type Attributes = Vec<(String, String)>;

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
	/// Element start, by local name. Self-closing elements produce an `Open`
	/// immediately followed by a `Close`.
	Open { name: String, attrs: Attributes },
	Close { name: String },
	Text(String),
	Eof,
}

pub struct PullParser<R: BufRead> {
	reader: Reader<R>,
	buf: Vec<u8>,
	pending_close: Option<String>,
	source_name: String,
}

impl<R: BufRead> PullParser<R> {
	pub fn new(input: R, source_name: &str) -> Self {
		let mut reader = Reader::from_reader(input);
		reader.config_mut().trim_text(true);
		Self {
			reader,
			buf: Vec::new(),
			pending_close: None,
			source_name: source_name.to_string(),
		}
	}

	pub fn source_name(&self) -> &str {
		&self.source_name
	}

	pub fn next_node(&mut self) -> Result<Node> {
		if let Some(name) = self.pending_close.take() {
			return Ok(Node::Close { name });
		}

		let source_name = &self.source_name;
		loop {
			let node = match self.reader.read_event_into(&mut self.buf) {
				Ok(Event::Start(e)) => Some(open_node(&e, source_name)?),
				Ok(Event::Empty(e)) => {
					let node = open_node(&e, source_name)?;
					if let Node::Open { name, .. } = &node {
						self.pending_close = Some(name.clone());
					}
					Some(node)
				}
				Ok(Event::End(e)) => Some(Node::Close {
					name: String::from_utf8_lossy(e.local_name().as_ref()).into_owned(),
				}),
				Ok(Event::Text(t)) => {
					let text = t.unescape().map_err(|e| malformed(source_name, e))?;
					Some(Node::Text(text.into_owned()))
				}
				Ok(Event::CData(c)) => Some(Node::Text(String::from_utf8_lossy(&c.into_inner()).into_owned())),
				Ok(Event::Eof) => Some(Node::Eof),
				Ok(_) => None,
				Err(e) => return Err(malformed(source_name, e)),
			};
			self.buf.clear();

			if let Some(node) = node {
				return Ok(node);
			}
		}
	}

	/// Collects the text content up to the close tag of the element just
	/// opened, skipping any nested markup.
	pub fn read_text(&mut self, element: &str) -> Result<String> {
		let mut text = String::new();
		let mut depth = 0usize;
		loop {
			match self.next_node()? {
				Node::Text(t) => text.push_str(&t),
				Node::Open { .. } => depth += 1,
				Node::Close { name } => {
					if depth == 0 && name == element {
						return Ok(text);
					}
					depth = depth.saturating_sub(1);
				}
				Node::Eof => return Err(self.truncated(element)),
			}
		}
	}

	pub fn truncated(&self, element: &str) -> MirrorError {
		MirrorError::MalformedFeed {
			source_name: self.source_name.clone(),
			reason: format!("document ended inside <{}>", element),
		}
	}
}

fn malformed(source_name: &str, reason: impl std::fmt::Display) -> MirrorError {
	MirrorError::MalformedFeed {
		source_name: source_name.to_string(),
		reason: reason.to_string(),
	}
}

fn open_node(e: &BytesStart<'_>, source_name: &str) -> Result<Node> {
	let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
	let mut attrs = Vec::new();
	for attr in e.attributes() {
		let attr = attr.map_err(|err| malformed(source_name, err))?;
		let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
		let value = attr.unescape_value().map_err(|err| malformed(source_name, err))?;
		attrs.push((key, value.into_owned()));
	}

	Ok(Node::Open { name, attrs })
}

fn attr(attrs: &Attributes, key: &str) -> Option<String> {
	attrs.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone())
}

fn non_empty(text: String) -> Option<String> {
	if text.is_empty() {
		None
	} else {
		Some(text)
	}
}

/// A record type that can be read out of a feed, starting at its element.
pub trait FeedRecord: Sized {
	/// Local name of the element that holds one record.
	const ELEMENT: &'static str;

	/// Reads the rest of the record after its opening tag. `Ok(None)` skips
	/// the element.
	fn read<R: BufRead>(parser: &mut PullParser<R>, attrs: Attributes) -> Result<Option<Self>>;
}

/// Lazy sequence of records in a feed document.
pub struct Records<R: BufRead, T: FeedRecord> {
	parser: PullParser<R>,
	done: bool,
	_record: PhantomData<T>,
}

impl<R: BufRead, T: FeedRecord> Records<R, T> {
	pub fn new(input: R, source_name: &str) -> Self {
		Self {
			parser: PullParser::new(input, source_name),
			done: false,
			_record: PhantomData,
		}
	}
}

impl<T: FeedRecord> Records<BufReader<File>, T> {
	pub fn from_path(path: &Path) -> Result<Self> {
		let file = File::open(path).map_err(|e| MirrorError::io(path, e))?;
		let name = path
			.file_name()
			.map(|n| n.to_string_lossy().into_owned())
			.unwrap_or_else(|| path.display().to_string());
		Ok(Self::new(BufReader::new(file), &name))
	}
}

impl<R: BufRead, T: FeedRecord> Iterator for Records<R, T> {
	type Item = Result<T>;

	fn next(&mut self) -> Option<Self::Item> {
		while !self.done {
			let result = match self.parser.next_node() {
				Ok(Node::Open { name, attrs }) if name == T::ELEMENT => T::read(&mut self.parser, attrs),
				Ok(Node::Eof) => {
					self.done = true;
					return None;
				}
				Ok(_) => continue,
				Err(e) => Err(e),
			};

			match result {
				Ok(Some(record)) => return Some(Ok(record)),
				Ok(None) => continue,
				Err(e) => {
					self.done = true;
					return Some(Err(e));
				}
			}
		}
		None
	}
}

/// Checks that a file on disk starts like an XML document.
pub fn probe_document(path: &Path) -> Result<()> {
	let bad_cache = |reason: String| MirrorError::MalformedLocalCache {
		path: path.display().to_string(),
		reason,
	};

	let file = File::open(path).map_err(|e| bad_cache(e.to_string()))?;
	let mut parser = PullParser::new(BufReader::new(file), &path.display().to_string());
	loop {
		match parser.next_node() {
			Ok(Node::Open { .. }) => return Ok(()),
			Ok(Node::Eof) => return Err(bad_cache("no root element".to_string())),
			Ok(_) => continue,
			Err(e) => return Err(bad_cache(e.to_string())),
		}
	}
}

impl FeedRecord for Cve {
	const ELEMENT: &'static str = "entry";

	fn read<R: BufRead>(parser: &mut PullParser<R>, attrs: Attributes) -> Result<Option<Self>> {
		let id = attr(&attrs, "id").unwrap_or_default();
		let name = CveName::parse(&id).map_err(|e| malformed(parser.source_name(), e))?;
		let mut cve = Cve::new(name);

		loop {
			match parser.next_node()? {
				Node::Open { name, attrs } => match name.as_str() {
					"product" => {
						let product = parser.read_text("product")?;
						if !product.is_empty() {
							cve.products.push(product);
						}
					}
					"reference" => {
						if let Some(href) = attr(&attrs, "href") {
							cve.references.push(href);
						}
					}
					"cwe" => {
						if cve.cwe.is_none() {
							cve.cwe = attr(&attrs, "id");
						}
					}
					"score" => {
						let text = parser.read_text("score")?;
						if cve.cvss.score.is_none() {
							cve.cvss.score = text.parse().ok();
						}
					}
					"summary" => {
						let text = non_empty(parser.read_text("summary")?);
						cve.summary = cve.summary.or(text);
					}
					"published-datetime" => {
						let text = non_empty(parser.read_text("published-datetime")?);
						cve.published = cve.published.or(text);
					}
					other => {
						let m = &mut cve.cvss;
						let slot = match other {
							"access-vector" => &mut m.access_vector,
							"access-complexity" => &mut m.access_complexity,
							"authentication" => &mut m.authentication,
							"confidentiality-impact" => &mut m.confidentiality_impact,
							"integrity-impact" => &mut m.integrity_impact,
							"availability-impact" => &mut m.availability_impact,
							_ => continue,
						};
						let text = non_empty(parser.read_text(other)?);
						if slot.is_none() {
							*slot = text;
						}
					}
				},
				Node::Close { name } if name == Self::ELEMENT => return Ok(Some(cve)),
				Node::Eof => return Err(parser.truncated(Self::ELEMENT)),
				_ => {}
			}
		}
	}
}

impl FeedRecord for CpeItem {
	const ELEMENT: &'static str = "cpe-item";

	fn read<R: BufRead>(parser: &mut PullParser<R>, attrs: Attributes) -> Result<Option<Self>> {
		let name22 = attr(&attrs, "name").ok_or_else(|| malformed(parser.source_name(), "cpe-item without a name"))?;
		let deprecated = attr(&attrs, "deprecated").as_deref() == Some("true");
		let mut name23 = None;
		let mut titles = BTreeMap::new();

		loop {
			match parser.next_node()? {
				Node::Open { name, attrs } => match name.as_str() {
					"title" => {
						let lang = attr(&attrs, "xml:lang").unwrap_or_default();
						let text = parser.read_text("title")?;
						titles.entry(lang).or_insert(text);
					}
					"cpe23-item" => {
						if name23.is_none() {
							name23 = attr(&attrs, "name");
						}
					}
					_ => {}
				},
				Node::Close { name } if name == Self::ELEMENT => break,
				Node::Eof => return Err(parser.truncated(Self::ELEMENT)),
				_ => {}
			}
		}

		let name23 = match name23 {
			Some(name) => name,
			None => match cpe22_to_cpe23(&name22) {
				Ok(name) => name,
				Err(e) => {
					warn!("Skipping dictionary item without a usable name: {}", e);
					return Ok(None);
				}
			},
		};

		Ok(Some(CpeItem {
			name23,
			name22,
			title: choose_title(titles),
			deprecated,
		}))
	}
}

/// `en-US`, else the first other English title, else the first title at all,
/// in language-tag order.
fn choose_title(mut titles: BTreeMap<String, String>) -> Option<String> {
	if let Some(title) = titles.remove("en-US") {
		return Some(title);
	}
	let english = titles.keys().find(|lang| lang.starts_with("en-")).cloned();
	match english {
		Some(lang) => titles.remove(&lang),
		None => titles.into_values().next(),
	}
}

impl FeedRecord for VendorStatementEntry {
	const ELEMENT: &'static str = "statement";

	fn read<R: BufRead>(parser: &mut PullParser<R>, attrs: Attributes) -> Result<Option<Self>> {
		let statement = parser.read_text(Self::ELEMENT)?;
		let cvename = attr(&attrs, "cvename").unwrap_or_default();

		match CveName::parse(&cvename) {
			Ok(cve) => Ok(Some(VendorStatementEntry {
				cve,
				statement: VendorStatement {
					contributor: attr(&attrs, "contributor").and_then(non_empty),
					organization: attr(&attrs, "organization").and_then(non_empty),
					statement,
				},
			})),
			Err(e) => {
				warn!("Skipping vendor statement: {}", e);
				Ok(None)
			}
		}
	}
}
