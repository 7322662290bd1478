use crate::checkpoint::WeightMap;

pub const PREFIX: &str = "cond_stage_model.transformer.";

/// Strips the LDM wrapper, inserts the `text_model.` level older exports lack and
/// drops non-parameter buffers.
pub fn convert(tensors: &WeightMap) -> WeightMap {
    tensors
        .iter()
        .filter_map(|(key, tensor)| {
            let key = key.strip_prefix(PREFIX)?;
            if key.ends_with("position_ids") {
                return None;
            }
            let key = if key.starts_with("text_model.") {
                key.to_string()
            } else {
                format!("text_model.{key}")
            };
            Some((key, tensor.clone()))
        })
        .collect()
}
