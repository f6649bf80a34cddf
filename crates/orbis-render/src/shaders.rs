//! WGSL programs for the globe.
//!
//! All programs share one vertex stage: tile vertices arrive as high/low
//! position pairs and are made relative to the eye before projection, so
//! planet-scale coordinates never lose precision in `f32`.

/// Shared uniform block and vertex stage.
const COMMON: &str = r#"
struct Globals {
    view_projection_rte: mat4x4<f32>,
    eye_high: vec4<f32>,
    eye_low: vec4<f32>,
    pick_color: vec4<f32>,
    layer_count: vec4<u32>,
    tints: array<vec4<f32>, 8>,
    biases: array<vec4<f32>, 8>,
};

@group(0) @binding(0)
var<uniform> globals: Globals;

struct VertexInput {
    @location(0) position_high: vec3<f32>,
    @location(1) position_low: vec3<f32>,
    @location(2) uv: vec2<f32>,
};

struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) uv: vec2<f32>,
};

fn relative_to_eye(high: vec3<f32>, low: vec3<f32>) -> vec3<f32> {
    let high_diff = high - globals.eye_high.xyz;
    let low_diff = low - globals.eye_low.xyz;
    return high_diff + low_diff;
}

@vertex
fn vs_main(in: VertexInput) -> VertexOutput {
    var out: VertexOutput;
    let position = relative_to_eye(in.position_high, in.position_low);
    out.clip_position = globals.view_projection_rte * vec4<f32>(position, 1.0);
    out.uv = in.uv;
    return out;
}
"#;

/// Imagery sampling for the single and overlay programs.
const IMAGERY: &str = r#"
@group(1) @binding(0) var layer_sampler: sampler;
@group(1) @binding(1) var layer0: texture_2d<f32>;
@group(1) @binding(2) var layer1: texture_2d<f32>;
@group(1) @binding(3) var layer2: texture_2d<f32>;
@group(1) @binding(4) var layer3: texture_2d<f32>;
@group(1) @binding(5) var layer4: texture_2d<f32>;
@group(1) @binding(6) var layer5: texture_2d<f32>;
@group(1) @binding(7) var layer6: texture_2d<f32>;
@group(1) @binding(8) var layer7: texture_2d<f32>;

fn layer_uv(i: u32, uv: vec2<f32>) -> vec2<f32> {
    let bias = globals.biases[i];
    return uv * bias.z + bias.xy;
}

fn blend(acc: vec3<f32>, i: u32, texel: vec4<f32>) -> vec3<f32> {
    let tint = globals.tints[i];
    let weight = select(0.0, texel.a * tint.a, i < globals.layer_count.x);
    return mix(acc, texel.rgb * tint.rgb, weight);
}

@fragment
fn fs_single(in: VertexOutput) -> @location(0) vec4<f32> {
    let texel = textureSample(layer0, layer_sampler, layer_uv(0u, in.uv));
    return vec4<f32>(texel.rgb, 1.0);
}

@fragment
fn fs_overlays(in: VertexOutput) -> @location(0) vec4<f32> {
    let t0 = textureSample(layer0, layer_sampler, layer_uv(0u, in.uv));
    let t1 = textureSample(layer1, layer_sampler, layer_uv(1u, in.uv));
    let t2 = textureSample(layer2, layer_sampler, layer_uv(2u, in.uv));
    let t3 = textureSample(layer3, layer_sampler, layer_uv(3u, in.uv));
    let t4 = textureSample(layer4, layer_sampler, layer_uv(4u, in.uv));
    let t5 = textureSample(layer5, layer_sampler, layer_uv(5u, in.uv));
    let t6 = textureSample(layer6, layer_sampler, layer_uv(6u, in.uv));
    let t7 = textureSample(layer7, layer_sampler, layer_uv(7u, in.uv));

    var color = vec3<f32>(0.0, 0.0, 0.0);
    color = blend(color, 0u, t0);
    color = blend(color, 1u, t1);
    color = blend(color, 2u, t2);
    color = blend(color, 3u, t3);
    color = blend(color, 4u, t4);
    color = blend(color, 5u, t5);
    color = blend(color, 6u, t6);
    color = blend(color, 7u, t7);
    return vec4<f32>(color, 1.0);
}
"#;

const PICKING: &str = r#"
@fragment
fn fs_picking(in: VertexOutput) -> @location(0) vec4<f32> {
    return globals.pick_color;
}
"#;

/// Source of the module holding `vs_main`, `fs_single` and `fs_overlays`.
pub fn globe_shader_source() -> String {
    format!("{COMMON}{IMAGERY}")
}

/// Source of the module holding `vs_main` and `fs_picking`.
pub fn picking_shader_source() -> String {
    format!("{COMMON}{PICKING}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_points_present() {
        let globe = globe_shader_source();
        assert!(globe.contains("fn vs_main"));
        assert!(globe.contains("fn fs_single"));
        assert!(globe.contains("fn fs_overlays"));
        let picking = picking_shader_source();
        assert!(picking.contains("fn vs_main"));
        assert!(picking.contains("fn fs_picking"));
        assert!(!picking.contains("layer_sampler"));
    }

    #[test]
    fn test_overlay_slots_match_capacity() {
        let globe = globe_shader_source();
        for i in 0..crate::MAX_OVERLAYS {
            assert!(globe.contains(&format!("var layer{i}: texture_2d<f32>")));
        }
        assert!(globe.contains(&format!("array<vec4<f32>, {}>", crate::MAX_OVERLAYS)));
    }
}
