//! Format negotiation with the remote compositing peer.
//!
//! The peer advertises which (format, modifier) pairs it can consume through
//! a feedback sequence: a lookup table of pairs, then one or more "tranches"
//! (preference groups bound to a device) referencing table entries by index,
//! then a final done event. [`FormatNegotiator`] consumes those events,
//! already decoded by the protocol layer, and publishes the tranche set
//! atomically: readers always see the last *complete* set, never a partial
//! one from an in-flight cycle.

use drm_fourcc::{DrmFourcc, DrmModifier};
use tracing::{debug, trace, warn};

use crate::error::FeedbackError;
use crate::formats;

/// Byte size of one format-table entry on the wire:
/// u32 fourcc, 4 bytes padding, u64 modifier, little-endian.
const TABLE_ENTRY_SIZE: usize = 16;

/// Negotiation progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// No format table received yet.
    AwaitingTable,
    /// Table known; tranches for the current cycle are accumulating.
    AwaitingTranches,
    /// A cycle just completed. Transient: the next event finds the
    /// negotiator back in `AwaitingTranches`.
    Ready,
}

/// One (format, modifier-set) pair inside a tranche.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrancheFormat {
    /// DRM fourcc code
    pub fourcc: DrmFourcc,
    /// Explicit modifiers advertised for the format
    pub modifiers: Vec<DrmModifier>,
    /// Whether the peer also accepts an implicit, driver-chosen layout
    pub implicit: bool,
}

impl TrancheFormat {
    /// A format with neither explicit modifiers nor implicit support is
    /// advertised but currently unusable for allocation.
    pub fn is_allocatable(&self) -> bool {
        self.implicit || !self.modifiers.is_empty()
    }
}

/// A preference group of formats bound to one target device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tranche {
    /// Device the formats should be allocated on
    pub device: libc::dev_t,
    /// Whether the peer prefers this tranche for direct scanout
    pub scanout: bool,
    /// Formats in preference order (distinguished formats first, see
    /// [`FormatNegotiator::handle_tranche_done`])
    pub formats: Vec<TrancheFormat>,
}

#[derive(Default)]
struct TrancheBuilder {
    device: Option<libc::dev_t>,
    scanout: bool,
    formats: Vec<TrancheFormat>,
}

/// State machine for the capability-discovery protocol.
///
/// Event handlers mirror the feedback events one-to-one and tolerate
/// out-of-order or repeated delivery: an event arriving in an unexpected
/// state is logged and absorbed rather than escalated, since the peer
/// controls sequencing and a strict client gains nothing by disconnecting.
#[derive(Default)]
pub struct FormatNegotiator {
    table: Vec<Option<(DrmFourcc, DrmModifier)>>,
    main_device: Option<libc::dev_t>,
    pending: Vec<Tranche>,
    builder: TrancheBuilder,
    published: Vec<Tranche>,
    ready: bool,
}

impl FormatNegotiator {
    /// Create a negotiator with no knowledge of the peer.
    pub fn new() -> Self {
        FormatNegotiator::default()
    }

    /// Current state.
    pub fn state(&self) -> NegotiationState {
        if !self.table.is_empty() {
            NegotiationState::AwaitingTranches
        } else if self.ready {
            NegotiationState::Ready
        } else {
            NegotiationState::AwaitingTable
        }
    }

    /// Whether at least one negotiation cycle has completed.
    ///
    /// Before this turns true, allocation transparently uses the
    /// shared-memory fallback.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// The peer's preferred allocation device, if announced.
    pub fn main_device(&self) -> Option<libc::dev_t> {
        self.main_device
    }

    /// The last complete tranche set.
    pub fn tranches(&self) -> &[Tranche] {
        &self.published
    }

    /// Tranches to try for an allocation, honoring a device preference.
    ///
    /// With a preference only tranches for that device are returned;
    /// without one, all tranches in received order.
    pub fn best_tranches(&self, preferred: Option<libc::dev_t>) -> impl Iterator<Item = &Tranche> {
        self.published
            .iter()
            .filter(move |t| preferred.is_none_or(|dev| t.device == dev))
    }

    /// Receive the format/modifier lookup table from its wire encoding.
    pub fn handle_format_table_bytes(&mut self, bytes: &[u8]) -> Result<(), FeedbackError> {
        if bytes.len() % TABLE_ENTRY_SIZE != 0 {
            return Err(FeedbackError::MalformedTable(format!(
                "table size {} is not a multiple of {TABLE_ENTRY_SIZE}",
                bytes.len()
            )));
        }
        let entries = bytes.chunks_exact(TABLE_ENTRY_SIZE).map(|chunk| {
            // chunks_exact guarantees the slice lengths.
            let fourcc = u32::from_le_bytes(chunk[0..4].try_into().unwrap_or_default());
            let modifier = u64::from_le_bytes(chunk[8..16].try_into().unwrap_or_default());
            (fourcc, modifier)
        });
        self.handle_format_table(entries);
        Ok(())
    }

    /// Receive the format/modifier lookup table as decoded entries.
    ///
    /// Unrecognized fourcc codes keep their table slot (indices sent later
    /// must stay aligned) but resolve to nothing.
    pub fn handle_format_table(&mut self, entries: impl IntoIterator<Item = (u32, u64)>) {
        self.table = entries
            .into_iter()
            .map(|(raw_fourcc, raw_modifier)| match DrmFourcc::try_from(raw_fourcc) {
                Ok(fourcc) => Some((fourcc, DrmModifier::from(raw_modifier))),
                Err(_) => {
                    trace!(raw_fourcc, "unrecognized fourcc in format table");
                    None
                }
            })
            .collect();
        debug!(entries = self.table.len(), "format table received");
    }

    /// Receive the peer's main device announcement.
    pub fn handle_main_device(&mut self, devnum: libc::dev_t) {
        self.main_device = Some(devnum);
    }

    /// Open the tranche accumulator for a target device.
    pub fn handle_tranche_target_device(&mut self, devnum: libc::dev_t) {
        self.builder.device = Some(devnum);
    }

    /// Receive the flags word for the current tranche (bit 0: scanout).
    pub fn handle_tranche_flags(&mut self, flags: u32) {
        self.builder.scanout = flags & 1 != 0;
    }

    /// Receive format indices for the current tranche.
    ///
    /// Peers usually send one format's modifiers contiguously, but nothing
    /// guarantees it, so each entry is re-grouped into its format bucket
    /// individually.
    pub fn handle_tranche_formats(&mut self, indices: &[u16]) {
        for &index in indices {
            let entry = match self.table.get(index as usize) {
                Some(Some(entry)) => *entry,
                Some(None) => continue,
                None => {
                    warn!(index, "tranche format index out of table bounds");
                    continue;
                }
            };
            let (fourcc, modifier) = entry;

            let pos = match self.builder.formats.iter().position(|f| f.fourcc == fourcc) {
                Some(pos) => pos,
                None => {
                    self.builder.formats.push(TrancheFormat {
                        fourcc,
                        modifiers: Vec::new(),
                        implicit: false,
                    });
                    self.builder.formats.len() - 1
                }
            };
            let bucket = &mut self.builder.formats[pos];

            if formats::is_implicit(modifier) {
                bucket.implicit = true;
            } else if !bucket.modifiers.contains(&modifier) {
                bucket.modifiers.push(modifier);
            }
        }
    }

    /// Close the current tranche and append it to the pending list.
    ///
    /// The format list is reordered so the opaque 32-bit format sits at
    /// index 0 and the alpha variant right after it, making the common
    /// opaque-UI allocation a first-try hit.
    pub fn handle_tranche_done(&mut self) {
        let builder = std::mem::take(&mut self.builder);
        let device = match builder.device.or(self.main_device) {
            Some(device) => device,
            None => {
                warn!("tranche completed without a target or main device, dropping");
                return;
            }
        };

        let mut formats = builder.formats;
        sort_distinguished_formats(&mut formats);

        trace!(device, formats = formats.len(), scanout = builder.scanout, "tranche complete");
        self.pending.push(Tranche {
            device,
            scanout: builder.scanout,
            formats,
        });
    }

    /// Complete the feedback cycle.
    ///
    /// The pending tranche list replaces the published one wholesale and
    /// the lookup table is released; the peer resends it next cycle.
    /// Returns `true` exactly once, when the first cycle completes — the
    /// caller's cue to announce that GPU-backed allocation is available.
    pub fn handle_done(&mut self) -> bool {
        self.published = std::mem::take(&mut self.pending);
        self.builder = TrancheBuilder::default();
        self.table = Vec::new();
        debug!(tranches = self.published.len(), "format negotiation cycle complete");

        let first = !self.ready;
        self.ready = true;
        first
    }
}

/// Move [`formats::OPAQUE_32`] to index 0 and [`formats::ALPHA_32`] directly
/// after it, keeping the relative order of everything else.
fn sort_distinguished_formats(formats_list: &mut Vec<TrancheFormat>) {
    let mut insert_at = 0;
    for distinguished in [formats::OPAQUE_32, formats::ALPHA_32] {
        if let Some(pos) = formats_list
            .iter()
            .position(|f| f.fourcc == distinguished)
        {
            if pos != insert_at {
                let entry = formats_list.remove(pos);
                formats_list.insert(insert_at, entry);
            }
            insert_at += 1;
        }
    }
}
