//! 3D mask 后处理: 最大连通域提取.

use std::collections::VecDeque;

use ndarray::Array3;

use crate::consts::mask;
use crate::Idx3d;

/// 提取 mask 中体素数最大的 3D 前景连通域, 其余前景清零.
///
/// 连通性为面相邻 (6-连通): 只有沿坐标轴相邻的体素属于同一连通域,
/// 对角相邻不算. 若 mask 中只存在一种体素值 (全背景或全前景),
/// 则原样返回. 体素数相同的并列最大连通域取扫描序 (行主序)
/// 中先被发现者, 保证结果确定.
///
/// 该操作是幂等的: 施加两次与施加一次结果相同.
pub fn largest_component(m: &Array3<u16>) -> Array3<u16> {
    let first = match m.first() {
        Some(&v) => v,
        None => return m.clone(),
    };
    if m.iter().all(|&v| v == first) {
        return m.clone();
    }

    let (labels, sizes) = label_components(m);
    // sizes 非空: mask 至少有两种值, 必然存在前景.
    // 并列最大时保留编号最小 (即扫描序最先发现) 的连通域.
    let mut largest = 1u32;
    let mut best = 0usize;
    for (idx, &s) in sizes.iter().enumerate() {
        if s > best {
            best = s;
            largest = idx as u32 + 1;
        }
    }

    labels.mapv(|l| {
        if l == largest {
            mask::FOREGROUND
        } else {
            mask::BACKGROUND
        }
    })
}

/// 对前景体素做 6-连通 BFS 标号. 返回标号数组 (背景为 0, 连通域从 1
/// 起按发现顺序编号) 与各连通域的体素数 (`sizes[i]` 对应标号 `i + 1`).
fn label_components(m: &Array3<u16>) -> (Array3<u32>, Vec<usize>) {
    let dim = m.dim();
    let mut labels = Array3::<u32>::zeros(dim);
    let mut sizes = Vec::new();
    let mut queue: VecDeque<Idx3d> = VecDeque::new();

    for (pos, &v) in m.indexed_iter() {
        if !mask::is_foreground(v) || labels[pos] != 0 {
            continue;
        }

        let label = sizes.len() as u32 + 1;
        let mut count = 0usize;
        labels[pos] = label;
        queue.push_back(pos);

        while let Some(cur) = queue.pop_front() {
            count += 1;
            for next in face_neighbours(cur, dim) {
                if mask::is_foreground(m[next]) && labels[next] == 0 {
                    labels[next] = label;
                    queue.push_back(next);
                }
            }
        }
        sizes.push(count);
    }
    (labels, sizes)
}

/// 收集 `pos` 的所有不越界面相邻索引.
fn face_neighbours((x, y, z): Idx3d, (nx, ny, nz): Idx3d) -> impl Iterator<Item = Idx3d> {
    let candidates = [
        (x.wrapping_sub(1), y, z),
        (x + 1, y, z),
        (x, y.wrapping_sub(1), z),
        (x, y + 1, z),
        (x, y, z.wrapping_sub(1)),
        (x, y, z + 1),
    ];
    candidates
        .into_iter()
        .filter(move |&(a, b, c)| a < nx && b < ny && c < nz)
}
