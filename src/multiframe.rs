//! Multiframe instance handling: functional-group combination and
//! fragment-to-frame indexing for encapsulated pixel data.

use dicom::core::value::Value;
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;
use log::debug;

use crate::error::DecodeError;
use crate::frame::FrameMeta;

/// Declared frame count of an instance (defaults to 1 when absent).
pub fn number_of_frames(object: &InMemDicomObject) -> u32 {
    object
        .element(tags::NUMBER_OF_FRAMES)
        .ok()
        .and_then(|element| element.to_int::<i32>().ok())
        .filter(|&count| count > 0)
        .map(|count| count as u32)
        .unwrap_or(1)
}

/// Combines functional-group attributes for one frame of a multiframe
/// instance: shallow-merge of the shared group item and the per-frame item,
/// with per-frame values taking precedence.
pub fn combine_frame_groups(
    object: &InMemDicomObject,
    frame_index: u32,
) -> Result<InMemDicomObject, DecodeError> {
    let mut merged = InMemDicomObject::new_empty();

    if let Some(shared) = sequence_item(object, tags::SHARED_FUNCTIONAL_GROUPS_SEQUENCE, 0) {
        for element in shared.iter() {
            merged.put(element.clone());
        }
    }

    if let Ok(element) = object.element(tags::PER_FRAME_FUNCTIONAL_GROUPS_SEQUENCE) {
        let items = match element.value() {
            Value::Sequence(sequence) => sequence.items(),
            _ => &[],
        };
        let item = items
            .get(frame_index as usize)
            .ok_or(DecodeError::FrameIndexOutOfRange {
                index: frame_index,
                available: items.len() as u32,
            })?;
        for element in item.iter() {
            merged.put(element.clone());
        }
    }

    Ok(merged)
}

/// Functional groups nest their payload one sequence deeper (for example
/// PixelMeasuresSequence inside the shared item); this flattens one level so
/// attribute lookups in [`FrameMeta::from_object`] see the payload directly.
pub fn flatten_groups(combined: &InMemDicomObject) -> InMemDicomObject {
    let mut flat = InMemDicomObject::new_empty();
    for element in combined.iter() {
        match element.value() {
            Value::Sequence(sequence) => {
                for item in sequence.items() {
                    for inner in item.iter() {
                        flat.put(inner.clone());
                    }
                }
            }
            _ => {
                flat.put(element.clone());
            }
        }
    }
    flat
}

fn sequence_item(
    object: &InMemDicomObject,
    tag: dicom::core::Tag,
    index: usize,
) -> Option<&InMemDicomObject> {
    match object.element(tag).ok()?.value() {
        Value::Sequence(sequence) => sequence.items().get(index),
        _ => None,
    }
}

/// Extracts the encoded bytes for one frame from the PixelData attribute.
///
/// Native (unencapsulated) data is sliced by the frame length derived from
/// `meta`. Encapsulated data is indexed through the basic offset table,
/// building one from fragment boundaries when the stream carries none.
pub fn frame_data(
    object: &InMemDicomObject,
    frame_index: u32,
    meta: &FrameMeta,
) -> Result<Vec<u8>, DecodeError> {
    let frames = number_of_frames(object);
    let element = object
        .element(tags::PIXEL_DATA)
        .map_err(|_| DecodeError::MissingAttribute("PixelData"))?;

    match element.value() {
        Value::PixelSequence(sequence) => {
            let fragments: &[Vec<u8>] = sequence.fragments();
            encapsulated_frame(fragments, sequence.offset_table(), frames, frame_index)
        }
        Value::Primitive(_) => {
            let bytes = element
                .to_bytes()
                .map_err(|err| DecodeError::InvalidAttribute {
                    name: "PixelData",
                    detail: err.to_string(),
                })?;
            let frame_len = meta.expected_pixel_data_length();
            let available = (bytes.len() / frame_len.max(1)) as u32;
            if frame_index >= frames || frame_index >= available {
                return Err(DecodeError::FrameIndexOutOfRange {
                    index: frame_index,
                    available: frames.min(available),
                });
            }
            let start = frame_index as usize * frame_len;
            Ok(bytes[start..start + frame_len].to_vec())
        }
        Value::Sequence(_) => Err(DecodeError::InvalidAttribute {
            name: "PixelData",
            detail: "unexpected data set sequence".to_string(),
        }),
    }
}

fn encapsulated_frame(
    fragments: &[Vec<u8>],
    offset_table: &[u32],
    frames: u32,
    frame_index: u32,
) -> Result<Vec<u8>, DecodeError> {
    if frame_index >= frames {
        return Err(DecodeError::FrameIndexOutOfRange {
            index: frame_index,
            available: frames,
        });
    }

    let table = if offset_table.len() >= frames as usize {
        offset_table[..frames as usize].to_vec()
    } else {
        build_offset_table(fragments, frames)?
    };

    // Each fragment starts 8 bytes (item tag + length) after the previous
    // fragment's payload, measured from the end of the offset table item.
    let starts = fragment_starts(fragments);
    let first = starts
        .iter()
        .position(|&start| start == table[frame_index as usize])
        .ok_or_else(|| {
            DecodeError::FragmentedFrames(format!(
                "offset {} does not fall on a fragment boundary",
                table[frame_index as usize]
            ))
        })?;
    let end = table
        .get(frame_index as usize + 1)
        .map(|&next| {
            starts
                .iter()
                .position(|&start| start == next)
                .ok_or_else(|| {
                    DecodeError::FragmentedFrames(format!(
                        "offset {next} does not fall on a fragment boundary"
                    ))
                })
        })
        .transpose()?
        .unwrap_or(fragments.len());

    let mut data = Vec::new();
    for fragment in &fragments[first..end] {
        data.extend_from_slice(fragment);
    }
    Ok(data)
}

/// Builds a basic offset table from fragment boundaries when the stream
/// carries an empty one.
fn build_offset_table(fragments: &[Vec<u8>], frames: u32) -> Result<Vec<u32>, DecodeError> {
    let frames = frames as usize;
    if fragments.len() < frames || fragments.len() % frames != 0 {
        return Err(DecodeError::FragmentedFrames(format!(
            "{} fragment(s) cannot be split evenly over {frames} frame(s) \
             without an offset table",
            fragments.len()
        )));
    }
    let per_frame = fragments.len() / frames;
    if per_frame > 1 {
        debug!("built offset table assuming {per_frame} fragments per frame");
    }
    let starts = fragment_starts(fragments);
    Ok((0..frames).map(|frame| starts[frame * per_frame]).collect())
}

fn fragment_starts(fragments: &[Vec<u8>]) -> Vec<u32> {
    let mut starts = Vec::with_capacity(fragments.len());
    let mut offset = 0u32;
    for fragment in fragments {
        starts.push(offset);
        offset += 8 + fragment.len() as u32;
    }
    starts
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom::core::value::{DataSetSequence, PixelFragmentSequence, PrimitiveValue};
    use dicom::core::{DataElement, VR};

    use crate::frame as pixel_frame;

    fn us(tag: dicom::core::Tag, value: u16) -> DataElement<InMemDicomObject> {
        DataElement::new(tag, VR::US, PrimitiveValue::from(value))
    }

    fn seq_of(
        tag: dicom::core::Tag,
        items: Vec<InMemDicomObject>,
    ) -> DataElement<InMemDicomObject> {
        DataElement::new(tag, VR::SQ, Value::from(DataSetSequence::from(items)))
    }

    #[test]
    fn per_frame_values_override_shared() {
        let shared_item =
            InMemDicomObject::from_element_iter(vec![us(tags::ROWS, 64), us(tags::COLUMNS, 64)]);
        let frame0 = InMemDicomObject::from_element_iter(vec![us(tags::ROWS, 32)]);
        let frame1 = InMemDicomObject::from_element_iter(vec![us(tags::ROWS, 16)]);

        let object = InMemDicomObject::from_element_iter(vec![
            seq_of(tags::SHARED_FUNCTIONAL_GROUPS_SEQUENCE, vec![shared_item]),
            seq_of(
                tags::PER_FRAME_FUNCTIONAL_GROUPS_SEQUENCE,
                vec![frame0, frame1],
            ),
        ]);

        let merged = combine_frame_groups(&object, 1).unwrap();
        let rows = merged.element(tags::ROWS).unwrap().to_int::<u16>().unwrap();
        let columns = merged
            .element(tags::COLUMNS)
            .unwrap()
            .to_int::<u16>()
            .unwrap();
        assert_eq!(rows, 16, "per-frame value must win");
        assert_eq!(columns, 64, "shared value must survive");
    }

    #[test]
    fn frame_index_beyond_groups_is_rejected() {
        let object = InMemDicomObject::from_element_iter(vec![seq_of(
            tags::PER_FRAME_FUNCTIONAL_GROUPS_SEQUENCE,
            vec![InMemDicomObject::new_empty()],
        )]);
        let err = combine_frame_groups(&object, 5).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::FrameIndexOutOfRange { index: 5, available: 1 }
        ));
    }

    fn test_meta() -> pixel_frame::FrameMeta {
        pixel_frame::FrameMeta {
            rows: 2,
            columns: 2,
            samples_per_pixel: 1,
            photometric: pixel_frame::PhotometricInterpretation::Monochrome2,
            bits_allocated: 8,
            bits_stored: 8,
            pixel_representation: pixel_frame::PixelRepresentation::Unsigned,
            planar_configuration: pixel_frame::PlanarConfiguration::Interleaved,
            float_pixel_data: false,
            palette: None,
        }
    }

    #[test]
    fn native_pixel_data_slices_by_frame_length() {
        let object = InMemDicomObject::from_element_iter(vec![
            DataElement::new(
                tags::NUMBER_OF_FRAMES,
                VR::IS,
                PrimitiveValue::from("2"),
            ),
            DataElement::new(
                tags::PIXEL_DATA,
                VR::OB,
                PrimitiveValue::from(vec![1u8, 2, 3, 4, 5, 6, 7, 8]),
            ),
        ]);
        assert_eq!(frame_data(&object, 0, &test_meta()).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(frame_data(&object, 1, &test_meta()).unwrap(), vec![5, 6, 7, 8]);
        let err = frame_data(&object, 2, &test_meta()).unwrap_err();
        assert!(matches!(err, DecodeError::FrameIndexOutOfRange { .. }));
    }

    fn encapsulated_object(
        offsets: Vec<u32>,
        fragments: Vec<Vec<u8>>,
        frames: &str,
    ) -> InMemDicomObject {
        InMemDicomObject::from_element_iter(vec![
            DataElement::new(
                tags::NUMBER_OF_FRAMES,
                VR::IS,
                PrimitiveValue::from(frames),
            ),
            DataElement::new(
                tags::PIXEL_DATA,
                VR::OB,
                Value::PixelSequence(PixelFragmentSequence::new(offsets, fragments)),
            ),
        ])
    }

    #[test]
    fn offset_table_groups_fragments_into_frames() {
        // Frame 0 spans two fragments (offsets 0 and 12); frame 1 is the third.
        let object = encapsulated_object(
            vec![0, 24],
            vec![vec![1, 2, 3, 4], vec![5, 6, 7, 8], vec![9, 10]],
            "2",
        );
        assert_eq!(
            frame_data(&object, 0, &test_meta()).unwrap(),
            vec![1, 2, 3, 4, 5, 6, 7, 8]
        );
        assert_eq!(frame_data(&object, 1, &test_meta()).unwrap(), vec![9, 10]);
    }

    #[test]
    fn missing_offset_table_falls_back_to_fragment_alignment() {
        let object =
            encapsulated_object(vec![], vec![vec![1, 2], vec![3, 4]], "2");
        assert_eq!(frame_data(&object, 0, &test_meta()).unwrap(), vec![1, 2]);
        assert_eq!(frame_data(&object, 1, &test_meta()).unwrap(), vec![3, 4]);
    }

    #[test]
    fn unalignable_fragments_are_an_error() {
        let object = encapsulated_object(
            vec![],
            vec![vec![1, 2], vec![3, 4], vec![5, 6]],
            "2",
        );
        let err = frame_data(&object, 0, &test_meta()).unwrap_err();
        assert!(matches!(err, DecodeError::FragmentedFrames(_)));
    }

    #[test]
    fn flatten_exposes_nested_group_payload() {
        let pixel_measures = InMemDicomObject::from_element_iter(vec![us(tags::ROWS, 8)]);
        let combined = InMemDicomObject::from_element_iter(vec![seq_of(
            tags::PIXEL_MEASURES_SEQUENCE,
            vec![pixel_measures],
        )]);
        let flat = flatten_groups(&combined);
        assert_eq!(flat.element(tags::ROWS).unwrap().to_int::<u16>().unwrap(), 8);
    }
}
