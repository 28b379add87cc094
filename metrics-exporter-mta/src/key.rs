use indexmap::IndexMap;

/// Replaces characters that would split a tag value into extra key segments.
///
/// Every `.` and `/` becomes `-`, and runs of `-` collapse into a single `-`.
pub fn sanitize_tag_value(value: &str) -> String {
    let mut sanitized = String::with_capacity(value.len());
    for c in value.chars() {
        let c = if matches!(c, '.' | '/') { '-' } else { c };
        if c == '-' && sanitized.ends_with('-') {
            continue;
        }
        sanitized.push(c);
    }
    sanitized
}

/// Ordered tag set of an account.
///
/// Tags keep the order in which they were first set; setting an existing tag again replaces its value in place.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tags {
    inner: IndexMap<String, String>,
}

impl Tags {
    /// Creates an empty tag set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a tag, sanitizing its value.
    pub fn insert(&mut self, name: &str, value: &str) {
        self.inner.insert(name.to_owned(), sanitize_tag_value(value));
    }

    /// Removes a tag, keeping the order of the remaining tags.
    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.inner.shift_remove(name)
    }

    /// Returns the (sanitized) value of a tag.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.inner.get(name).map(String::as_str)
    }

    /// Returns `true` if there are no tags.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Returns the number of tags.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Iterates over tags in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<'a> FromIterator<(&'a str, &'a str)> for Tags {
    fn from_iter<I: IntoIterator<Item = (&'a str, &'a str)>>(iter: I) -> Self {
        let mut tags = Tags::new();
        for (name, value) in iter {
            tags.insert(name, value);
        }
        tags
    }
}

/// Rendered tag segment appended to every key of a flush cycle.
///
/// Rendering walks the whole tag set, so a client renders it once per flush and reuses it for every key in that
/// flush.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TagBlock(String);

impl TagBlock {
    /// Renders `tags` as `<prefix><name>.<value>` pairs joined with `.`.
    pub fn render(tag_prefix: &str, tags: &Tags) -> Self {
        let mut block = String::new();
        for (name, value) in tags.iter() {
            if !block.is_empty() {
                block.push('.');
            }
            block.push_str(tag_prefix);
            block.push_str(name);
            block.push('.');
            block.push_str(value);
        }
        TagBlock(block)
    }

    /// Returns the rendered block.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` if no tags were rendered.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Builds fully-qualified metric keys for one account and one flush cycle.
pub struct KeyBuilder<'a> {
    account: &'a str,
    tags: TagBlock,
}

impl<'a> KeyBuilder<'a> {
    /// Creates a `KeyBuilder` for `account`, rendering the tag block once.
    pub fn new(account: &'a str, tag_prefix: &str, tags: &Tags) -> Self {
        KeyBuilder { account, tags: TagBlock::render(tag_prefix, tags) }
    }

    /// Builds the key for a local metric name: `<account>.<name>.<tags>`.
    ///
    /// The tag segment is left off entirely when the account has no tags.
    pub fn build(&self, name: &str) -> String {
        let mut key = String::with_capacity(self.account.len() + name.len() + self.tags.0.len() + 2);
        key.push_str(self.account);
        key.push('.');
        key.push_str(name);
        if !self.tags.is_empty() {
            key.push('.');
            key.push_str(self.tags.as_str());
        }
        key
    }
}

/// Builds a single fully-qualified metric key.
///
/// Prefer [`KeyBuilder`] when building many keys with the same tags.
pub fn build_key(account: &str, tag_prefix: &str, tags: &Tags, name: &str) -> String {
    KeyBuilder::new(account, tag_prefix, tags).build(name)
}
