//! Per-node page state for outbound traffic
//!
//! A [`CanNodeRegistry`] holds the full ten-page image of every CAN node the
//! bridge has written to, and remembers which pages were written so they can
//! be resent periodically. CoE offers no acknowledgement, so written pages
//! stay dirty forever and every resend tick transmits all of them again.

use bytes::Bytes;
use coe_protocol::{
    is_analog_page, is_digital_page, AnalogPage, AnalogSlot, CoeVersion, DigitalPage, Message,
    MeasureType, ANALOG_SLOTS, DIGITAL_BITS, PAGE_COUNT,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{trace, warn};

use crate::error::{CoeError, Result};

/// Node registry shared by a peer's channel registries and its sender
pub type SharedNodeRegistry = Arc<Mutex<CanNodeRegistry>>;

/// One page of a node image
#[derive(Debug, Clone, PartialEq)]
pub enum PageContent {
    /// Pages 0 and 9
    Digital([bool; DIGITAL_BITS]),
    /// Pages 1..=8
    Analog([AnalogSlot; ANALOG_SLOTS]),
}

impl PageContent {
    fn default_for(page: u8) -> Self {
        if is_digital_page(page) {
            PageContent::Digital([false; DIGITAL_BITS])
        } else {
            PageContent::Analog([AnalogSlot::default(); ANALOG_SLOTS])
        }
    }

    fn to_message(&self, node: u8, page: u8) -> Message {
        match self {
            PageContent::Digital(bits) => Message::Digital(DigitalPage {
                node,
                page,
                bits: *bits,
            }),
            PageContent::Analog(slots) => Message::Analog(AnalogPage {
                node,
                page,
                slots: *slots,
            }),
        }
    }
}

/// Full ten-page image of one CAN node
#[derive(Debug, Clone, PartialEq)]
pub struct NodeState {
    pages: Vec<PageContent>,
}

impl NodeState {
    fn new() -> Self {
        Self {
            pages: (0..PAGE_COUNT).map(PageContent::default_for).collect(),
        }
    }

    /// Content of a page
    pub fn page(&self, page: u8) -> Option<&PageContent> {
        self.pages.get(usize::from(page))
    }
}

/// Page images and dirty pages of all written nodes
#[derive(Debug)]
pub struct CanNodeRegistry {
    version: CoeVersion,
    nodes: BTreeMap<u8, NodeState>,
    dirty: BTreeMap<u8, BTreeSet<u8>>,
}

impl CanNodeRegistry {
    /// Create an empty registry encoding with the given version
    pub fn new(version: CoeVersion) -> Self {
        Self {
            version,
            nodes: BTreeMap::new(),
            dirty: BTreeMap::new(),
        }
    }

    /// Create a registry wrapped for sharing
    pub fn shared(version: CoeVersion) -> SharedNodeRegistry {
        Arc::new(Mutex::new(Self::new(version)))
    }

    /// Protocol version used for serialization
    pub fn version(&self) -> CoeVersion {
        self.version
    }

    /// Whether a node has been written
    pub fn contains_node(&self, node: u8) -> bool {
        self.nodes.contains_key(&node)
    }

    /// Page image of a node, if written
    pub fn node(&self, node: u8) -> Option<&NodeState> {
        self.nodes.get(&node)
    }

    /// Set one bit of a digital page
    pub fn update_digital_entry(
        &mut self,
        node: u8,
        page: u8,
        index: usize,
        state: bool,
    ) -> Result<()> {
        if !is_digital_page(page) || index >= DIGITAL_BITS {
            return Err(CoeError::InvalidPage { node, page });
        }
        match self.page_mut(node, page) {
            PageContent::Digital(bits) => bits[index] = state,
            PageContent::Analog(_) => return Err(CoeError::InvalidPage { node, page }),
        }
        trace!(node, page, index, state, "Digital page entry updated");
        Ok(())
    }

    /// Set one slot of an analog page
    pub fn update_analog_entry(
        &mut self,
        node: u8,
        page: u8,
        index: usize,
        value: f64,
        measure: MeasureType,
    ) -> Result<()> {
        if !is_analog_page(page) || index >= ANALOG_SLOTS {
            return Err(CoeError::InvalidPage { node, page });
        }
        match self.page_mut(node, page) {
            PageContent::Analog(slots) => slots[index] = AnalogSlot::new(value, measure),
            PageContent::Digital(_) => return Err(CoeError::InvalidPage { node, page }),
        }
        trace!(node, page, index, value, %measure, "Analog page entry updated");
        Ok(())
    }

    /// Serialize one page of a written node
    pub fn page_bytes(&self, node: u8, page: u8) -> Result<Bytes> {
        let state = self.nodes.get(&node).ok_or(CoeError::UnknownNode(node))?;
        let content = state.page(page).ok_or(CoeError::InvalidPage { node, page })?;
        Ok(content.to_message(node, page).encode(self.version)?)
    }

    /// Serialize every written page, node by node, page by page
    ///
    /// The dirty set is left untouched.
    pub fn bytes_for_all_written_pages(&self) -> Vec<Bytes> {
        self.written_pages()
            .into_iter()
            .filter_map(|(node, page)| match self.page_bytes(node, page) {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    warn!(node, page, "Skipping unserializable page: {}", e);
                    None
                }
            })
            .collect()
    }

    /// All written (node, page) pairs in iteration order
    pub fn written_pages(&self) -> Vec<(u8, u8)> {
        self.dirty
            .iter()
            .flat_map(|(node, pages)| pages.iter().map(move |page| (*node, *page)))
            .collect()
    }

    fn page_mut(&mut self, node: u8, page: u8) -> &mut PageContent {
        self.dirty.entry(node).or_default().insert(page);
        let state = self.nodes.entry(node).or_insert_with(NodeState::new);
        &mut state.pages[usize::from(page)]
    }
}
