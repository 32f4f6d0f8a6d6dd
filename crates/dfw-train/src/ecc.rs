use dfw_tensor::{Shape, Tensor};

/// Error-correcting code applied to messages before embedding and to
/// predictions after decoding. Bits are 0.0/1.0.
pub trait MessageCode: Send {
    /// Codeword length for a message of `msg_len` bits.
    fn encoded_len(&self, msg_len: usize) -> usize;

    fn encode(&self, bits: &[f64]) -> Vec<f64>;

    fn decode(&self, bits: &[f64]) -> Vec<f64>;

    /// Encode every row of a `[N, L]` batch.
    fn encode_batch(&self, msgs: &Tensor) -> Tensor {
        map_rows(msgs, |row| self.encode(row))
    }

    /// Decode every row of a `[N, L']` batch.
    fn decode_batch(&self, codewords: &Tensor) -> Tensor {
        map_rows(codewords, |row| self.decode(row))
    }
}

fn map_rows(batch: &Tensor, f: impl Fn(&[f64]) -> Vec<f64>) -> Tensor {
    let n = batch.batch_len();
    let mut width = 0;
    let mut data = Vec::new();
    for row in batch.rows() {
        let out = f(row);
        width = out.len();
        data.extend(out);
    }
    Tensor::new(data, Shape::from_slice(&[n, width]))
}

/// Hamming(7,4): every nibble becomes `p1 p2 d1 p3 d2 d3 d4`, correcting
/// any single flipped bit per block. A trailing partial nibble is passed
/// through unprotected.
#[derive(Debug, Clone, Copy, Default)]
pub struct Hamming74;

impl Hamming74 {
    fn bit(v: f64) -> u8 {
        u8::from(v > 0.5)
    }

    fn encode_block(d: [u8; 4]) -> [u8; 7] {
        let p1 = d[0] ^ d[1] ^ d[3];
        let p2 = d[0] ^ d[2] ^ d[3];
        let p3 = d[1] ^ d[2] ^ d[3];
        [p1, p2, d[0], p3, d[1], d[2], d[3]]
    }

    fn decode_block(mut c: [u8; 7]) -> [u8; 4] {
        let s1 = c[0] ^ c[2] ^ c[4] ^ c[6];
        let s2 = c[1] ^ c[2] ^ c[5] ^ c[6];
        let s3 = c[3] ^ c[4] ^ c[5] ^ c[6];
        // 1-based position of the flipped bit
        let syndrome = (s1 | (s2 << 1) | (s3 << 2)) as usize;
        if syndrome != 0 {
            c[syndrome - 1] ^= 1;
        }
        [c[2], c[4], c[5], c[6]]
    }
}

impl MessageCode for Hamming74 {
    fn encoded_len(&self, msg_len: usize) -> usize {
        msg_len / 4 * 7 + msg_len % 4
    }

    fn encode(&self, bits: &[f64]) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.encoded_len(bits.len()));
        let blocks = bits.chunks_exact(4);
        let tail = blocks.remainder();
        for block in blocks {
            let d = [0, 1, 2, 3].map(|i| Self::bit(block[i]));
            out.extend(Self::encode_block(d).iter().map(|&b| b as f64));
        }
        out.extend(tail.iter().map(|&b| Self::bit(b) as f64));
        out
    }

    fn decode(&self, bits: &[f64]) -> Vec<f64> {
        let blocks = bits.chunks_exact(7);
        let tail = blocks.remainder();
        let mut out = Vec::with_capacity(bits.len() / 7 * 4 + tail.len());
        for block in blocks {
            let c = [0, 1, 2, 3, 4, 5, 6].map(|i| Self::bit(block[i]));
            out.extend(Self::decode_block(c).iter().map(|&b| b as f64));
        }
        out.extend(tail.iter().map(|&b| Self::bit(b) as f64));
        out
    }
}
