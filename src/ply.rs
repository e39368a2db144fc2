//! Colored point cloud export of a reconstruction's 3D points.

use anyhow::{anyhow, Result};
use ply_rs::ply::{
    Addable, DefaultElement, ElementDef, Encoding, Ply, Property, PropertyDef, PropertyType, ScalarType,
};
use ply_rs::writer::Writer;

use crate::reconstruction::Reconstruction;

/// `points3D.ply` body: one ASCII `vertex` per 3D point with `x y z red green blue`.
pub fn points_to_ply(model: &Reconstruction) -> Result<Vec<u8>> {
    let mut ply = Ply::<DefaultElement>::new();
    ply.header.encoding = Encoding::Ascii;
    ply.header
        .comments
        .push(format!("{} reconstructed points", model.num_points()));

    let mut vertex = ElementDef::new("vertex".to_string());
    for name in ["x", "y", "z"] {
        vertex.properties.add(PropertyDef::new(
            name.to_string(),
            PropertyType::Scalar(ScalarType::Float),
        ));
    }
    for name in ["red", "green", "blue"] {
        vertex.properties.add(PropertyDef::new(
            name.to_string(),
            PropertyType::Scalar(ScalarType::UChar),
        ));
    }
    ply.header.elements.add(vertex);

    let vertices: Vec<DefaultElement> = model
        .points
        .values()
        .map(|point| {
            let mut element = DefaultElement::new();
            element.insert("x".to_string(), Property::Float(point.xyz.x as f32));
            element.insert("y".to_string(), Property::Float(point.xyz.y as f32));
            element.insert("z".to_string(), Property::Float(point.xyz.z as f32));
            element.insert("red".to_string(), Property::UChar(point.color[0]));
            element.insert("green".to_string(), Property::UChar(point.color[1]));
            element.insert("blue".to_string(), Property::UChar(point.color[2]));
            element
        })
        .collect();
    ply.payload.insert("vertex".to_string(), vertices);

    ply.make_consistent()
        .map_err(|e| anyhow!("Inconsistent point cloud: {:?}", e))?;

    let mut buf = Vec::new();
    Writer::new().write_ply(&mut buf, &mut ply)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconstruction::Point3D;
    use nalgebra::Point3;
    use ply_rs::parser::Parser;

    #[test]
    fn exports_one_vertex_per_point() {
        let mut model = Reconstruction::default();
        for (id, x) in [(3u64, 1.5f64), (9, -2.0)] {
            model.points.insert(
                id,
                Point3D {
                    xyz: Point3::new(x, 0.25, 4.0),
                    color: [10, 20, 30],
                    error: 0.5,
                    track: Vec::new(),
                },
            );
        }

        let bytes = points_to_ply(&model).unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.starts_with("ply\nformat ascii 1.0"));
        assert!(text.contains("element vertex 2"));
        assert!(text.contains("property uchar red"));

        let parsed = Parser::<DefaultElement>::new()
            .read_ply(&mut bytes.as_slice())
            .unwrap();
        let vertices = &parsed.payload["vertex"];
        assert_eq!(vertices.len(), 2);
        assert_eq!(vertices[0]["x"], Property::Float(1.5));
        assert_eq!(vertices[1]["x"], Property::Float(-2.0));
        assert_eq!(vertices[1]["blue"], Property::UChar(30));
    }

    #[test]
    fn empty_model_exports_header_only() {
        let bytes = points_to_ply(&Reconstruction::default()).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("element vertex 0"));
        assert!(text.trim_end().ends_with("end_header"));
    }
}
