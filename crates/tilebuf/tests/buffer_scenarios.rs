//! End-to-end buffer scenarios over small (4×4) tiles.

use tilebuf::config::{self, BufferConfig};
use tilebuf::{AbyssPolicy, Buffer};
use tilebuf_core::{PixelFormat, Rect};

fn setup() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        config::init(BufferConfig {
            tile_width: 4,
            tile_height: 4,
            ..BufferConfig::default()
        })
        .unwrap();
    });
}

fn write_f32(buffer: &Buffer, x: i32, y: i32, v: f32) {
    buffer.set_pixel(x, y, None, &v.to_ne_bytes());
}

fn read_f32(buffer: &Buffer, x: i32, y: i32) -> f32 {
    let mut out = [0u8; 4];
    buffer.get_pixel(x, y, None, &mut out, AbyssPolicy::None);
    f32::from_ne_bytes(out)
}

#[test]
fn checkerboard_gather() {
    setup();
    let buffer = Buffer::new(Rect::new(0, 0, 20, 20), PixelFormat::Y_F32);
    let cell = |x: i32, y: i32| -> f32 {
        if ((x / 3) ^ (y / 3)) & 1 == 0 {
            1.0
        } else {
            0.0
        }
    };
    for y in 0..20 {
        for x in 0..20 {
            write_f32(&buffer, x, y, cell(x, y));
        }
    }

    let mut out = vec![0u8; 20 * 20 * 4];
    buffer.get(&Rect::new(0, 0, 20, 20), 1.0, None, &mut out, 0, AbyssPolicy::None);
    for y in 0..20 {
        for x in 0..20 {
            let at = ((y * 20 + x) * 4) as usize;
            let v = f32::from_ne_bytes(out[at..at + 4].try_into().unwrap());
            assert_eq!(v, cell(x, y), "at ({x}, {y})");
        }
    }
}

#[test]
fn fill_then_sub_buffer_fill() {
    setup();
    let parent = Buffer::new(Rect::new(0, 0, 20, 20), PixelFormat::Y_F32);
    parent.set_color(None, [0.5, 0.5, 0.5, 1.0]);

    let sub = parent.create_sub_buffer(Rect::new(5, 5, 10, 10));
    sub.set_color(None, [1.0, 1.0, 1.0, 1.0]);

    for y in 0..20 {
        for x in 0..20 {
            let v = read_f32(&parent, x, y);
            let inside = (5..15).contains(&x) && (5..15).contains(&y);
            let expected = if inside { 1.0 } else { 0.5 };
            assert_eq!(v, expected, "at ({x}, {y})");
            assert_ne!(v, 0.0);
        }
    }
}

#[test]
fn shift_composition() {
    setup();
    let parent = Buffer::new(Rect::new(0, 0, 20, 20), PixelFormat::Y_F32);
    let child = parent.create_sub_buffer(Rect::new(5, 5, 10, 10));
    let grandchild = child.create_sub_buffer_shifted(Rect::new(5, 5, 4, 4), 8, 0);

    grandchild.set_color(None, [1.0, 1.0, 1.0, 1.0]);

    // the grandchild's window lands at (5+5+8, 5+5) in the parent, and
    // the abyss composition clips it to two columns
    let lit = Rect::new(18, 10, 2, 4);
    let mut ones = 0;
    for y in 0..20 {
        for x in 0..20 {
            let v = read_f32(&parent, x, y);
            if lit.contains(x, y) {
                assert_eq!(v, 1.0, "at ({x}, {y})");
                ones += 1;
            } else {
                assert_eq!(v, 0.0, "at ({x}, {y})");
            }
        }
    }
    assert_eq!(ones, 8);
}

/// Checkerboard generator used by the scaled scenarios: cell size 2,
/// values 0 and 1.
fn checker_u8(x: i32, y: i32) -> u8 {
    if ((x / 2) ^ (y / 2)) & 1 == 0 {
        0
    } else {
        1
    }
}

#[test]
fn scaled_get_box_filter() {
    setup();
    let buffer = Buffer::new(Rect::new(0, 0, 50, 50), PixelFormat::Y_U8);
    for y in 0..50 {
        for x in 0..50 {
            buffer.set_pixel(x, y, None, &[checker_u8(x, y)]);
        }
    }

    let rect = Rect::new(0, 0, 12, 8);
    let scale = 1.2f64;
    let mut out = vec![0u8; (rect.width * rect.height) as usize];
    buffer.get(&rect, scale, None, &mut out, 0, AbyssPolicy::None);

    // independent rendition of the 2x2 box filter with bilinear weights
    for y in 0..rect.height {
        for x in 0..rect.width {
            let sx = (x as f64 + 0.5) / scale;
            let sy = (y as f64 + 0.5) / scale;
            let jj = sx.floor() as i32;
            let ii = sy.floor() as i32;

            let left = (0.5 - scale * (sx - jj as f64)).max(0.0);
            let right = (0.5 - scale * ((jj + 1) as f64 - sx)).max(0.0);
            let center = 1.0 - left - right;
            let top = (0.5 - scale * (sy - ii as f64)).max(0.0);
            let bottom = (0.5 - scale * ((ii + 1) as f64 - sy)).max(0.0);
            let middle = 1.0 - top - bottom;

            let mut sum = 0.0f64;
            for (dy, wy) in [(-1, top), (0, middle), (1, bottom)] {
                for (dx, wx) in [(-1, left), (0, center), (1, right)] {
                    if wx > 0.0 && wy > 0.0 {
                        sum += checker_u8(jj + dx, ii + dy) as f64 * wx * wy;
                    }
                }
            }
            let expected = sum.round() as i32;
            let got = out[(y * rect.width + x) as usize] as i32;
            assert!(
                (got - expected).abs() <= 1,
                "at ({x}, {y}): got {got}, expected {expected}"
            );
        }
    }
}

#[test]
fn abyss_loop_scaled_matches_pretiled() {
    setup();
    // the looping buffer: pattern lives in (0,0,10,10)
    let small = Buffer::new(Rect::new(0, 0, 10, 10), PixelFormat::Y_U8);
    for y in 0..10 {
        for x in 0..10 {
            small.set_pixel(x, y, None, &[checker_u8(x, y)]);
        }
    }

    // the reference: the same pattern explicitly tiled 3x3, viewed
    // through a window on the center copy
    let big = Buffer::new(Rect::new(0, 0, 30, 30), PixelFormat::Y_U8);
    for y in 0..30 {
        for x in 0..30 {
            big.set_pixel(x, y, None, &[checker_u8(x % 10, y % 10)]);
        }
    }
    let center = big.create_sub_buffer(Rect::new(10, 10, 10, 10));

    let rect = Rect::new(-2, -2, 10, 10);
    let mut looped = vec![0u8; 100];
    small.get(&rect, 0.66, None, &mut looped, 0, AbyssPolicy::Loop);
    let mut tiled = vec![0u8; 100];
    center.get(&rect, 0.66, None, &mut tiled, 0, AbyssPolicy::None);

    assert_eq!(looped, tiled);
}

#[test]
fn linear_view_gradient_round_trip() {
    setup();
    let buffer = Buffer::new(Rect::new(0, 0, 40, 20), PixelFormat::Y_F32);
    {
        let mut view = buffer.linear_open(None, None).expect("open");
        let rowstride = view.rowstride();
        let data = view.data_mut();
        for y in 0..20usize {
            for x in 0..40usize {
                let v = (x + y) as f32 / 40.0;
                let at = y * rowstride + x * 4;
                data[at..at + 4].copy_from_slice(&v.to_ne_bytes());
            }
        }
        view.close();
    }

    let mut out = vec![0u8; 40 * 20 * 4];
    buffer.get(&Rect::new(0, 0, 40, 20), 1.0, None, &mut out, 0, AbyssPolicy::None);
    for y in 0..20usize {
        for x in 0..40usize {
            let at = (y * 40 + x) * 4;
            let v = f32::from_ne_bytes(out[at..at + 4].try_into().unwrap());
            assert_eq!(v, (x + y) as f32 / 40.0, "at ({x}, {y})");
        }
    }
}

#[test]
fn sub_buffer_reads_compose_with_window_origin() {
    setup();
    let buffer = Buffer::new(Rect::new(0, 0, 16, 16), PixelFormat::Y_F32);
    for y in 0..16 {
        for x in 0..16 {
            write_f32(&buffer, x, y, (y * 16 + x) as f32);
        }
    }
    let window = Rect::new(3, 7, 8, 6);
    let sub = buffer.create_sub_buffer(window);
    for y in 0..window.height {
        for x in 0..window.width {
            assert_eq!(
                read_f32(&sub, x, y),
                read_f32(&buffer, x + window.x, y + window.y),
                "at ({x}, {y})"
            );
        }
    }
}

#[test]
fn copy_is_transitive_on_aligned_buffers() {
    setup();
    let extent = Rect::new(0, 0, 20, 20);
    let a = Buffer::new(extent, PixelFormat::Y_F32);
    for y in 0..20 {
        for x in 0..20 {
            write_f32(&a, x, y, ((x * 31 + y * 7) % 17) as f32);
        }
    }

    let b = Buffer::new(extent, PixelFormat::Y_F32);
    let c = Buffer::new(extent, PixelFormat::Y_F32);
    let c2 = Buffer::new(extent, PixelFormat::Y_F32);

    Buffer::copy(&a, Some(&extent), &b, Some(&extent));
    Buffer::copy(&b, Some(&extent), &c, Some(&extent));
    Buffer::copy(&a, Some(&extent), &c2, Some(&extent));

    for y in 0..20 {
        for x in 0..20 {
            assert_eq!(read_f32(&c, x, y), read_f32(&a, x, y), "c at ({x}, {y})");
            assert_eq!(read_f32(&c2, x, y), read_f32(&a, x, y), "c2 at ({x}, {y})");
        }
    }
}

#[test]
fn copy_shares_tiles_until_written() {
    setup();
    let extent = Rect::new(0, 0, 8, 8);
    let a = Buffer::new(extent, PixelFormat::Y_F32);
    for y in 0..8 {
        for x in 0..8 {
            write_f32(&a, x, y, 5.0);
        }
    }
    let b = a.dup();
    for y in 0..8 {
        for x in 0..8 {
            assert_eq!(read_f32(&b, x, y), 5.0);
        }
    }

    // writing the copy must not disturb the original
    write_f32(&b, 0, 0, 9.0);
    assert_eq!(read_f32(&a, 0, 0), 5.0);
    assert_eq!(read_f32(&b, 0, 0), 9.0);
}

#[test]
fn abyss_none_scatter_leaves_outside_untouched() {
    setup();
    let buffer = Buffer::new(Rect::new(0, 0, 8, 8), PixelFormat::Y_F32);
    // scatter a 8x8 block positioned half outside the extent
    let src = vec![1.0f32.to_ne_bytes(); 64].concat();
    buffer.set(Some(&Rect::new(4, 4, 8, 8)), 0, None, &src, 0);

    for y in 0..8 {
        for x in 0..8 {
            let inside = x >= 4 && y >= 4;
            let expected = if inside { 1.0 } else { 0.0 };
            assert_eq!(read_f32(&buffer, x, y), expected, "at ({x}, {y})");
        }
    }

    // nothing outside the extent became readable
    assert_eq!(read_f32(&buffer, 8, 8), 0.0);
}

#[test]
fn loop_policy_is_periodic_in_both_axes() {
    setup();
    let buffer = Buffer::new(Rect::new(0, 0, 12, 8), PixelFormat::Y_F32);
    for y in 0..8 {
        for x in 0..12 {
            write_f32(&buffer, x, y, (y * 12 + x) as f32);
        }
    }
    let probe = |x: i32, y: i32| -> f32 {
        let mut out = [0u8; 4];
        buffer.get_pixel(x, y, None, &mut out, AbyssPolicy::Loop);
        f32::from_ne_bytes(out)
    };
    for &(x, y) in &[(0, 0), (5, 3), (-1, -1), (11, 7), (-13, 9)] {
        assert_eq!(probe(x, y), probe(x + 12, y), "x period at ({x}, {y})");
        assert_eq!(probe(x, y), probe(x, y + 8), "y period at ({x}, {y})");
    }
}
