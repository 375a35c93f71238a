//! Binary checkpoint format.
//!
//! Little-endian throughout:
//!
//! ```text
//! magic:u32
//! n_vocab n_ctx n_embd n_head n_layer format : i32 x 6
//! count:i32, then count x { len:i32, bytes[len] }
//! until EOF: { elements:i32, n_dims:i32, dims:i32[n_dims], name_len:i32, name, payload }
//! ```
//!
//! Dimensions are innermost first. The payload holds `elements` values of
//! `WeightFormat::element_size(n_dims)` bytes each.

use crate::config::{Hyperparameters, WeightFormat};
use crate::error::LoadError;
use crate::tokenizer::Vocabulary;
use crate::weights::{ModelWeights, TensorSlot};
use half::f16;

pub const MAGIC: u32 = 0x6767_6d6c;

/// Cursor over the checkpoint bytes. Every read names the section it belongs to.
struct ByteReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> ByteReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn is_at_end(&self) -> bool {
        self.offset >= self.data.len()
    }

    fn take(&mut self, len: usize, section: &'static str) -> Result<&'a [u8], LoadError> {
        let available = self.data.len() - self.offset;
        if len > available {
            return Err(LoadError::Truncated {
                section,
                offset: self.offset,
                needed: len - available,
            });
        }
        let bytes = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(bytes)
    }

    fn u32(&mut self, section: &'static str) -> Result<u32, LoadError> {
        let bytes = self.take(4, section)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn i32(&mut self, section: &'static str) -> Result<i32, LoadError> {
        let bytes = self.take(4, section)?;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Reads an `i32` that must not be negative.
    fn read_len(&mut self, section: &'static str, what: &'static str) -> Result<usize, LoadError> {
        let offset = self.offset;
        let value = self.i32(section)?;
        usize::try_from(value).map_err(|_| LoadError::NegativeLength {
            what,
            value,
            offset,
        })
    }
}

/// One decoded tensor record.
#[derive(Debug, Clone)]
pub struct TensorRecord {
    pub name: String,
    /// Innermost first.
    pub dims: Vec<usize>,
    pub data: Vec<f32>,
}

/// Streaming reader: header and vocabulary eagerly, tensors on demand.
pub struct CheckpointReader<'a> {
    reader: ByteReader<'a>,
    hparams: Hyperparameters,
    vocab: Vocabulary,
}

impl<'a> CheckpointReader<'a> {
    pub fn new(data: &'a [u8]) -> Result<Self, LoadError> {
        let mut reader = ByteReader::new(data);

        let magic = reader.u32("magic")?;
        if magic != MAGIC {
            return Err(LoadError::BadMagic { found: magic });
        }

        let mut header = [0usize; 5];
        for (slot, what) in header
            .iter_mut()
            .zip(["n_vocab", "n_ctx", "n_embd", "n_head", "n_layer"])
        {
            *slot = reader.read_len("hyperparameters", what)?;
        }
        let format = WeightFormat::from_tag(reader.i32("hyperparameters")?)?;
        let [n_vocab, n_ctx, n_embd, n_head, n_layer] = header;
        let hparams = Hyperparameters {
            n_vocab,
            n_ctx,
            n_embd,
            n_head,
            n_layer,
            format,
        };
        hparams.validate()?;

        let count = reader.read_len("vocabulary", "vocabulary size")?;
        if count > n_vocab {
            return Err(LoadError::VocabularyOverflow { count, n_vocab });
        }
        // `count` is unchecked until its entries have been read.
        let mut tokens = Vec::new();
        for _ in 0..count {
            let len = reader.read_len("vocabulary", "token length")?;
            tokens.push(reader.take(len, "vocabulary")?.to_vec());
        }

        Ok(Self {
            reader,
            hparams,
            vocab: Vocabulary::from_tokens(tokens),
        })
    }

    pub fn hparams(&self) -> &Hyperparameters {
        &self.hparams
    }

    pub fn vocab(&self) -> &Vocabulary {
        &self.vocab
    }

    pub fn into_vocab(self) -> Vocabulary {
        self.vocab
    }

    /// Next tensor record, or `None` at a clean end of stream.
    pub fn next_tensor(&mut self) -> Result<Option<TensorRecord>, LoadError> {
        if self.reader.is_at_end() {
            return Ok(None);
        }
        let reader = &mut self.reader;

        let declared = reader.read_len("tensor header", "element count")?;
        let n_dims = reader.read_len("tensor header", "dimension count")?;
        let name_offset = reader.offset;
        if !(1..=2).contains(&n_dims) {
            return Err(LoadError::InvalidDimensionality {
                name: format!("<record at byte {name_offset}>"),
                n_dims,
            });
        }
        let mut dims = Vec::with_capacity(n_dims);
        for _ in 0..n_dims {
            dims.push(reader.read_len("tensor header", "dimension")?);
        }

        let name_len = reader.read_len("tensor header", "name length")?;
        let name_offset = reader.offset;
        let raw_name = reader.take(name_len, "tensor name")?;
        let raw_name = raw_name.strip_suffix(b"\0").unwrap_or(raw_name);
        let name = std::str::from_utf8(raw_name)
            .map_err(|_| LoadError::InvalidTensorName {
                offset: name_offset,
            })?
            .to_string();

        let computed: usize = dims.iter().product();
        if computed != declared {
            return Err(LoadError::ElementCountMismatch {
                name,
                declared,
                computed,
            });
        }

        let element_size = self.hparams.format.element_size(n_dims);
        let payload = reader.take(declared * element_size, "tensor payload")?;
        let data = match element_size {
            2 => payload
                .chunks_exact(2)
                .map(|c| f16::from_bits(u16::from_le_bytes([c[0], c[1]])).to_f32())
                .collect(),
            _ => payload
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        };

        Ok(Some(TensorRecord { name, dims, data }))
    }
}

/// Serializes a model in checkpoint form. Used to build fixtures and converted files.
pub fn write_checkpoint(
    hparams: &Hyperparameters,
    vocab: &Vocabulary,
    weights: &ModelWeights,
) -> Vec<u8> {
    fn put_i32(out: &mut Vec<u8>, value: usize) {
        out.extend_from_slice(&(value as i32).to_le_bytes());
    }

    let mut out = Vec::new();

    out.extend_from_slice(&MAGIC.to_le_bytes());
    for value in [
        hparams.n_vocab,
        hparams.n_ctx,
        hparams.n_embd,
        hparams.n_head,
        hparams.n_layer,
    ] {
        put_i32(&mut out, value);
    }
    out.extend_from_slice(&hparams.format.tag().to_le_bytes());

    put_i32(&mut out, vocab.len());
    for token in vocab.tokens() {
        put_i32(&mut out, token.len());
        out.extend_from_slice(token);
    }

    for slot in TensorSlot::all(hparams.n_layer) {
        let Some(view) = weights.tensor(slot) else {
            continue;
        };
        let dims = view.dims();
        let values = view.to_vec();
        let name = slot.name();

        put_i32(&mut out, values.len());
        put_i32(&mut out, dims.len());
        for dim in &dims {
            put_i32(&mut out, *dim);
        }
        put_i32(&mut out, name.len());
        out.extend_from_slice(name.as_bytes());

        if hparams.format.element_size(dims.len()) == 2 {
            for value in values {
                out.extend_from_slice(&f16::from_f32(value).to_bits().to_le_bytes());
            }
        } else {
            for value in values {
                out.extend_from_slice(&value.to_le_bytes());
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_vocab() -> Vocabulary {
        Vocabulary::from_tokens(vec![b"a".to_vec(), b"bc".to_vec(), b"<|endoftext|>".to_vec()])
    }

    fn header_bytes(format: i32) -> Vec<u8> {
        let mut out = MAGIC.to_le_bytes().to_vec();
        for value in [8i32, 4, 4, 2, 1, format] {
            out.extend_from_slice(&value.to_le_bytes());
        }
        out
    }

    #[test]
    fn reads_header_vocab_and_every_tensor() {
        let hparams = Hyperparameters::tiny();
        let weights = ModelWeights::random(&hparams, 3);
        let bytes = write_checkpoint(&hparams, &tiny_vocab(), &weights);

        let mut reader = CheckpointReader::new(&bytes).expect("header");
        assert_eq!(reader.hparams(), &hparams);
        assert_eq!(reader.vocab().len(), 3);
        assert_eq!(reader.vocab().token(1), Some(&b"bc"[..]));

        let first = reader.next_tensor().expect("record").expect("present");
        assert_eq!(first.name, "model/wte");
        assert_eq!(first.dims, vec![16, 64]);
        assert_eq!(first.data.len(), 16 * 64);
        assert_eq!(first.data[17], weights.token_embeddings[[1, 1]]);

        let mut count = 1;
        while reader.next_tensor().expect("record").is_some() {
            count += 1;
        }
        assert_eq!(count, 5 + 12 * hparams.n_layer);
    }

    #[test]
    fn half_precision_matrices_decode_close_to_source() {
        let mut hparams = Hyperparameters::tiny();
        hparams.format = WeightFormat::F16;
        let weights = ModelWeights::random(&hparams, 5);
        let bytes = write_checkpoint(&hparams, &tiny_vocab(), &weights);

        let mut reader = CheckpointReader::new(&bytes).expect("header");
        let wte = reader.next_tensor().expect("record").expect("present");
        for (decoded, original) in wte.data.iter().zip(weights.token_embeddings.iter()) {
            approx::assert_abs_diff_eq!(*decoded, *original, epsilon = 1e-3);
        }
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = header_bytes(0);
        bytes[0] ^= 0xff;
        assert!(matches!(
            CheckpointReader::new(&bytes),
            Err(LoadError::BadMagic { .. })
        ));
    }

    #[test]
    fn rejects_unknown_format_tag() {
        let bytes = header_bytes(3);
        assert!(matches!(
            CheckpointReader::new(&bytes),
            Err(LoadError::UnsupportedFormat(3))
        ));
    }

    #[test]
    fn truncation_names_the_section() {
        let mut bytes = header_bytes(0);
        bytes.extend_from_slice(&2i32.to_le_bytes());
        bytes.extend_from_slice(&5i32.to_le_bytes());
        bytes.extend_from_slice(b"ab");
        match CheckpointReader::new(&bytes) {
            Err(LoadError::Truncated {
                section, needed, ..
            }) => {
                assert_eq!(section, "vocabulary");
                assert_eq!(needed, 3);
            }
            other => panic!("expected truncation, got {:?}", other.err()),
        }

        let hparams = Hyperparameters::tiny();
        let full = write_checkpoint(&hparams, &tiny_vocab(), &ModelWeights::random(&hparams, 1));
        let cut = &full[..full.len() - 10];
        let mut reader = CheckpointReader::new(cut).expect("header intact");
        let err = loop {
            match reader.next_tensor() {
                Ok(Some(_)) => continue,
                Ok(None) => panic!("truncated stream ended cleanly"),
                Err(err) => break err,
            }
        };
        assert!(matches!(
            err,
            LoadError::Truncated {
                section: "tensor payload",
                ..
            }
        ));
    }

    #[test]
    fn vocabulary_larger_than_model_is_rejected() {
        let mut bytes = header_bytes(0);
        bytes.extend_from_slice(&9i32.to_le_bytes());
        assert!(matches!(
            CheckpointReader::new(&bytes),
            Err(LoadError::VocabularyOverflow { count: 9, n_vocab: 8 })
        ));
    }

    #[test]
    fn trailing_nul_is_stripped_from_names() {
        let mut bytes = header_bytes(0);
        bytes.extend_from_slice(&0i32.to_le_bytes());
        for value in [4i32, 1, 4, 13] {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        bytes.extend_from_slice(b"model/ln_f/g\0");
        for value in [1.0f32, 2.0, 3.0, 4.0] {
            bytes.extend_from_slice(&value.to_le_bytes());
        }

        let mut reader = CheckpointReader::new(&bytes).expect("header");
        let record = reader.next_tensor().expect("record").expect("present");
        assert_eq!(record.name, "model/ln_f/g");
        assert_eq!(record.data, vec![1.0, 2.0, 3.0, 4.0]);
        assert!(reader.next_tensor().expect("end").is_none());
    }

    #[test]
    fn element_count_must_match_dims() {
        let mut bytes = header_bytes(0);
        bytes.extend_from_slice(&0i32.to_le_bytes());
        for value in [5i32, 1, 4, 12] {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        bytes.extend_from_slice(b"model/ln_f/g");

        let mut reader = CheckpointReader::new(&bytes).expect("header");
        assert!(matches!(
            reader.next_tensor(),
            Err(LoadError::ElementCountMismatch {
                declared: 5,
                computed: 4,
                ..
            })
        ));
    }
}
