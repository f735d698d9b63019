use indexmap::IndexMap;

/// A generic configuration element: tag name, ordered attributes and
/// ordered children. Text content is not part of the configuration model.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub attributes: IndexMap<String, String>,
    pub children: Vec<Element>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(child);
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub fn set_attribute(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(name.into(), value.into());
    }

    pub fn remove_attribute(&mut self, name: &str) -> Option<String> {
        self.attributes.shift_remove(name)
    }

    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut Element> {
        self.children.iter_mut().find(|c| c.name == name)
    }

    /// First child with this name, appending an empty one if absent.
    pub fn child_or_insert(&mut self, name: &str) -> &mut Element {
        let idx = match self.children.iter().position(|c| c.name == name) {
            Some(idx) => idx,
            None => {
                self.children.push(Element::new(name));
                self.children.len() - 1
            }
        };
        &mut self.children[idx]
    }

    /// Follow a chain of child names.
    pub fn descend<S: AsRef<str>>(&self, path: &[S]) -> Option<&Element> {
        path.iter()
            .try_fold(self, |node, name| node.child(name.as_ref()))
    }

    pub fn descend_mut<S: AsRef<str>>(&mut self, path: &[S]) -> Option<&mut Element> {
        let mut node = self;
        for name in path {
            node = node.child_mut(name.as_ref())?;
        }
        Some(node)
    }

    /// Follow a chain of child names, creating missing elements.
    pub fn descend_or_insert<S: AsRef<str>>(&mut self, path: &[S]) -> &mut Element {
        let mut node = self;
        for name in path {
            node = node.child_or_insert(name.as_ref());
        }
        node
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty() && self.children.is_empty()
    }

    /// Drop descendants that carry no attributes and no children,
    /// bottom-up. Returns true if `self` ended up empty.
    pub fn prune_empty(&mut self) -> bool {
        self.children.retain_mut(|child| !child.prune_empty());
        self.is_empty()
    }
}
