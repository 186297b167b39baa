//! XOR operation schedules over packets
//!
//! Fragments are processed in blocks of `w * packet_size` bytes; each block
//! holds `w` packets per fragment. A schedule is a flat list of packet copies
//! and XORs that is replayed on every block. Devices are numbered data first
//! (`0..k`), then coding (`k..k+m`).

use super::bitmatrix::BitMatrix;

/// What an operation does to its destination packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// dst = src
    Copy,
    /// dst ^= src
    Xor,
    /// dst = 0 (rows with no source bits)
    Zero,
}

/// One packet-level operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operation {
    pub kind: OpKind,
    pub src_device: usize,
    pub src_packet: usize,
    pub dst_device: usize,
    pub dst_packet: usize,
}

/// A row to compute: destination packet plus the source packets it XORs
#[derive(Debug, Clone)]
pub struct RowPlan {
    pub dst: (usize, usize),
    pub sources: Vec<(usize, usize)>,
}

/// Precomputed list of operations
#[derive(Debug, Clone, Default)]
pub struct Schedule {
    ops: Vec<Operation>,
}

impl Schedule {
    /// Straightforward schedule: every row is computed from its sources
    pub fn from_rows(rows: &[RowPlan]) -> Self {
        let mut ops = Vec::new();
        for row in rows {
            push_row(&mut ops, row.dst, &row.sources);
        }
        Self { ops }
    }

    /// Encoding schedule that reuses already-computed coding packets.
    ///
    /// Rows are emitted cheapest first. A row whose bit pattern is close to
    /// an already-emitted row starts from a copy of that coding packet and
    /// XORs only the differing data packets.
    pub fn smart_encoding(matrix: &BitMatrix, k: usize, w: usize) -> Self {
        let rows = matrix.rows();
        let mut done = vec![false; rows];
        let mut cost: Vec<usize> = (0..rows).map(|r| matrix.row_weight(r)).collect();
        let mut derived_from: Vec<Option<usize>> = vec![None; rows];
        let mut ops = Vec::new();

        let coding_packet = |row: usize| (k + row / w, row % w);
        let data_packet = |col: usize| (col / w, col % w);

        for _ in 0..rows {
            let next = (0..rows)
                .filter(|&r| !done[r])
                .min_by_key(|&r| cost[r])
                .unwrap_or(0);

            match derived_from[next] {
                None => {
                    let sources: Vec<_> =
                        matrix.row_ones(next).into_iter().map(data_packet).collect();
                    push_row(&mut ops, coding_packet(next), &sources);
                }
                Some(base) => {
                    let (dst_device, dst_packet) = coding_packet(next);
                    let (src_device, src_packet) = coding_packet(base);
                    ops.push(Operation {
                        kind: OpKind::Copy,
                        src_device,
                        src_packet,
                        dst_device,
                        dst_packet,
                    });
                    for col in 0..matrix.cols() {
                        if matrix.get(next, col) != matrix.get(base, col) {
                            let (src_device, src_packet) = data_packet(col);
                            ops.push(Operation {
                                kind: OpKind::Xor,
                                src_device,
                                src_packet,
                                dst_device,
                                dst_packet,
                            });
                        }
                    }
                }
            }
            done[next] = true;

            for other in 0..rows {
                if done[other] {
                    continue;
                }
                let diff = matrix
                    .row(next)
                    .iter()
                    .zip(matrix.row(other))
                    .filter(|(a, b)| a != b)
                    .count();
                if diff + 1 < cost[other] {
                    cost[other] = diff + 1;
                    derived_from[other] = Some(next);
                }
            }
        }

        Self { ops }
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn operations(&self) -> &[Operation] {
        &self.ops
    }

    /// Number of XOR operations (a cost measure)
    pub fn xor_count(&self) -> usize {
        self.ops.iter().filter(|op| op.kind == OpKind::Xor).count()
    }

    /// Replay the schedule over every `w * packet_size` block of the fragments
    pub fn execute(&self, fragments: &mut [Vec<u8>], w: usize, packet_size: usize) {
        let fragment_size = fragments.first().map(|f| f.len()).unwrap_or(0);
        let block = w * packet_size;
        let mut base = 0;
        while base + block <= fragment_size {
            for op in &self.ops {
                apply(op, fragments, base, packet_size);
            }
            base += block;
        }
    }
}

fn push_row(ops: &mut Vec<Operation>, dst: (usize, usize), sources: &[(usize, usize)]) {
    let (dst_device, dst_packet) = dst;
    if sources.is_empty() {
        ops.push(Operation {
            kind: OpKind::Zero,
            src_device: dst_device,
            src_packet: dst_packet,
            dst_device,
            dst_packet,
        });
        return;
    }

    for (i, &(src_device, src_packet)) in sources.iter().enumerate() {
        ops.push(Operation {
            kind: if i == 0 { OpKind::Copy } else { OpKind::Xor },
            src_device,
            src_packet,
            dst_device,
            dst_packet,
        });
    }
}

fn apply(op: &Operation, fragments: &mut [Vec<u8>], base: usize, packet_size: usize) {
    let src_start = base + op.src_packet * packet_size;
    let dst_start = base + op.dst_packet * packet_size;

    if op.kind == OpKind::Zero {
        fragments[op.dst_device][dst_start..dst_start + packet_size].fill(0);
        return;
    }

    if op.src_device == op.dst_device {
        if src_start == dst_start {
            return;
        }
        let buf = &mut fragments[op.dst_device];
        let (src, dst) = if src_start < dst_start {
            let (head, tail) = buf.split_at_mut(dst_start);
            (&head[src_start..src_start + packet_size], &mut tail[..packet_size])
        } else {
            let (head, tail) = buf.split_at_mut(src_start);
            (&tail[..packet_size], &mut head[dst_start..dst_start + packet_size])
        };
        combine(op.kind, src, dst);
        return;
    }

    let (src_buf, dst_buf) = if op.src_device < op.dst_device {
        let (head, tail) = fragments.split_at_mut(op.dst_device);
        (&head[op.src_device], &mut tail[0])
    } else {
        let (head, tail) = fragments.split_at_mut(op.src_device);
        (&tail[0], &mut head[op.dst_device])
    };
    combine(
        op.kind,
        &src_buf[src_start..src_start + packet_size],
        &mut dst_buf[dst_start..dst_start + packet_size],
    );
}

fn combine(kind: OpKind, src: &[u8], dst: &mut [u8]) {
    match kind {
        OpKind::Copy => dst.copy_from_slice(src),
        OpKind::Xor => {
            for (d, s) in dst.iter_mut().zip(src) {
                *d ^= *s;
            }
        }
        OpKind::Zero => dst.fill(0),
    }
}
