//! Precomputed transfers of one producer buffer
//!
//! A template pairs a source buffer with its destination buffers and holds
//! the copy requests posted for them. Ops are ordered data, metadata, then
//! the fill flag of the destination, so a consumer that sees the flag also
//! sees the bytes.

use crate::buffer::FlagMode;
use crate::driver::{XferOp, XferRequest, XferService};
use crate::port::Port;

/// One destination buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemplateTarget {
    pub set: usize,
    pub ordinal: usize,
    pub buffer: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateKind {
    /// Producer copied into consumer buffers
    Push,
    /// A consumer copied out of a producer buffer on its lane
    Pull { lane: usize },
}

#[derive(Debug)]
pub struct TransferTemplate {
    producer: usize,
    buffer: usize,
    sequence: u64,
    kind: TemplateKind,
    targets: Vec<TemplateTarget>,
    requests: Vec<XferRequest>,
}

fn payload_ops(src: &Port, src_buffer: usize, dst: &Port, dst_buffer: usize) -> Vec<XferOp> {
    let meta = src.meta(src_buffer);
    let len = (meta.length as usize)
        .min(src.layout().buffer_size)
        .min(dst.layout().buffer_size);
    vec![
        XferOp::Copy {
            src: src.region().clone(),
            src_offset: src.layout().data(src_buffer),
            dst: dst.region().clone(),
            dst_offset: dst.layout().data(dst_buffer),
            len,
        },
        XferOp::Copy {
            src: src.region().clone(),
            src_offset: src.layout().meta(src_buffer),
            dst: dst.region().clone(),
            dst_offset: dst.layout().meta(dst_buffer),
            len: src.layout().meta_pitch,
        },
    ]
}

/// Claim `target` on `consumer` for an incoming copy and return its fill op
fn land(consumer: &mut Port, target: usize, mode: FlagMode) -> XferOp {
    let slot = consumer.slot_mut(target);
    slot.fills += 1;
    slot.reserved = true;
    let value = mode.encode(slot.fills);
    consumer.advance_ring(target);
    XferOp::Flag {
        dst: consumer.region().clone(),
        offset: consumer.layout().full(target),
        value,
    }
}

impl TransferTemplate {
    /// Empty push template for a Full producer buffer
    pub fn push(producer: &Port, buffer: usize) -> Self {
        Self {
            producer: producer.ordinal(),
            buffer,
            sequence: producer.meta(buffer).sequence,
            kind: TemplateKind::Push,
            targets: Vec::new(),
            requests: Vec::new(),
        }
    }

    /// Post the copy of the source buffer into `consumer[target]`
    pub fn add_push_target(
        &mut self,
        xfer: &dyn XferService,
        producer: &Port,
        set: usize,
        consumer: &mut Port,
        target: usize,
        mode: FlagMode,
    ) {
        let mut ops = payload_ops(producer, self.buffer, consumer, target);
        ops.push(land(consumer, target, mode));
        self.requests.push(xfer.post(ops));
        self.targets.push(TemplateTarget {
            set,
            ordinal: consumer.ordinal(),
            buffer: target,
        });
    }

    /// Post a consumer-side pull of `producer[buffer]` into `consumer[target]`
    ///
    /// After the data lands the consumer marks its own buffer Full and
    /// writes its drain lane in the producer with the fill count it saw.
    pub fn pull(
        xfer: &dyn XferService,
        producer: &Port,
        buffer: usize,
        fill: u64,
        consumer: &mut Port,
        target: usize,
        mode: FlagMode,
    ) -> Self {
        let lane = consumer.lane();
        let mut ops = payload_ops(producer, buffer, consumer, target);
        ops.push(land(consumer, target, mode));
        ops.push(XferOp::Flag {
            dst: producer.region().clone(),
            offset: producer.layout().empty(buffer, lane),
            value: mode.encode(fill),
        });

        Self {
            producer: producer.ordinal(),
            buffer,
            sequence: producer.meta(buffer).sequence,
            kind: TemplateKind::Pull { lane },
            targets: vec![TemplateTarget {
                set: 0,
                ordinal: consumer.ordinal(),
                buffer: target,
            }],
            requests: vec![xfer.post(ops)],
        }
    }

    /// Set index of pull targets, which the template itself cannot know
    pub(crate) fn in_set(mut self, set: usize) -> Self {
        for target in &mut self.targets {
            target.set = set;
        }
        self
    }

    pub fn producer(&self) -> usize {
        self.producer
    }

    pub fn buffer(&self) -> usize {
        self.buffer
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn kind(&self) -> TemplateKind {
        self.kind
    }

    pub fn targets(&self) -> &[TemplateTarget] {
        &self.targets
    }

    /// Every posted request has executed
    pub fn is_complete(&self) -> bool {
        self.requests.iter().all(XferRequest::is_complete)
    }

    pub fn is_pending(&self) -> bool {
        !self.is_complete()
    }
}
